//! Telemetry module tests.

use discardable_host::telemetry::{
    init_logging, init_metrics, record_allocation_failure, record_bytes_allocated,
    record_enforcement_pass, record_eviction, record_memory_limit, record_pressure_signal,
    AllocationSpan, LogConfig, LogError, LogFormat, SpanExt,
};
use discardable_host::{ClientId, SegmentId};
use tracing::Span;

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_json() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_format_parses_known_names() {
    assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert!(matches!(
        "yaml".parse::<LogFormat>(),
        Err(LogError::InvalidFormat(_))
    ));
}

#[test]
fn log_config_deserializes_with_defaults() {
    let config: LogConfig = toml::from_str("format = \"pretty\"").unwrap();
    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, "info");
}

#[test]
fn invalid_filter_is_rejected_before_install() {
    let config = LogConfig {
        format: LogFormat::Json,
        level: "discardable_host=notalevel".to_string(),
        output_path: None,
    };
    assert!(matches!(init_logging(&config), Err(LogError::InvalidFilter(_))));
}

#[test]
fn logging_to_file_installs_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        format: LogFormat::Json,
        level: "debug".to_string(),
        output_path: Some(dir.path().join("host.log")),
    };
    init_logging(&config).unwrap();
    assert!(dir.path().join("host.log").exists());

    assert!(matches!(
        init_logging(&config),
        Err(LogError::AlreadyInitialized)
    ));
}

#[test]
fn log_error_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert!(error.to_string().contains("bad filter"));
    assert!(LogError::AlreadyInitialized
        .to_string()
        .contains("already initialized"));
}

// =============================================================================
// Span Tests
// =============================================================================

#[test]
fn span_ext_record_result_handles_both_arms() {
    let span = Span::none();
    let ok: Result<i32, &str> = Ok(42);
    span.record_result(&ok);
    let err: Result<i32, &str> = Err("mapping failed");
    span.record_result(&err);
}

#[test]
fn allocation_span_enters_without_subscriber() {
    let span = AllocationSpan::new(ClientId(4), SegmentId(2), 4096);
    let _guard = span.enter();
    span.record("mapped_bytes", 8192usize);
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[test]
fn metrics_without_recorder_are_noops() {
    init_metrics();
    init_metrics();
    record_bytes_allocated(1024);
    record_bytes_allocated(0);
    record_memory_limit(usize::MAX / 2);
    record_eviction(3, 3 * 4096);
    record_allocation_failure("mapping_failed");
    record_pressure_signal("critical");
    record_enforcement_pass();
}
