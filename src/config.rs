//! Host configuration loading from environment variables or a TOML file.
//!
//! Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `DSM_MEMORY_LIMIT` | from physical memory | Discardable byte budget |
//! | `DSM_LOW_END_DEVICE` | false | Shrink the default budget cap by 8x |
//! | `DSM_ENFORCE_DELAY_MS` | 1000 | Deferred enforcement delay (ms) |
//! | `DSM_LOG_FORMAT` | json | `json` or `pretty` |
//! | `DSM_LOG_LEVEL` | info | Log filter directive |

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::memory::{ManagerConfig, ENFORCE_MEMORY_POLICY_DELAY_MS};
use crate::telemetry::{LogConfig, LogFormat};

const MIB: usize = 1024 * 1024;

/// Upper bound on the default budget.
pub const MAX_DEFAULT_MEMORY_LIMIT: usize = 512 * MIB;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Everything the host needs at startup.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub manager: ManagerConfig,
    pub low_end_device: bool,
    pub log: LogConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            low_end_device: false,
            log: LogConfig::default(),
        }
    }
}

/// Default budget: a quarter of physical memory, capped at
/// [`MAX_DEFAULT_MEMORY_LIMIT`] (an eighth of that on low-end devices).
pub fn default_memory_limit(low_end_device: bool) -> usize {
    let mut cap = MAX_DEFAULT_MEMORY_LIMIT;
    if low_end_device {
        cap /= 8;
    }
    match physical_memory() {
        Some(physical) => (physical / 4).min(cap).max(1),
        None => cap,
    }
}

#[cfg(target_os = "linux")]
fn physical_memory() -> Option<usize> {
    let info = rustix::system::sysinfo();
    let bytes = (info.totalram as u64).checked_mul(u64::from(info.mem_unit.max(1)))?;
    usize::try_from(bytes).ok().filter(|&b| b > 0)
}

#[cfg(not(target_os = "linux"))]
fn physical_memory() -> Option<usize> {
    None
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let format = std::env::var("DSM_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    let level = std::env::var("DSM_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    LogConfig {
        format,
        level,
        output_path: defaults.output_path,
    }
}

/// Load all configuration from environment variables.
pub fn load() -> HostConfig {
    let low_end_device = parse_bool("DSM_LOW_END_DEVICE", false);
    let memory_limit = parse_usize("DSM_MEMORY_LIMIT", default_memory_limit(low_end_device));
    let memory_limit = memory_limit.max(1);
    let enforce_delay_ms = parse_u64("DSM_ENFORCE_DELAY_MS", ENFORCE_MEMORY_POLICY_DELAY_MS);
    let enforce_delay_ms = enforce_delay_ms.max(1);

    HostConfig {
        manager: ManagerConfig {
            memory_limit,
            enforce_delay_ms,
            runtime: None,
        },
        low_end_device,
        log: load_log_config(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    memory_limit: Option<usize>,
    enforce_delay_ms: Option<u64>,
    low_end_device: bool,
    log: LogConfig,
}

/// Parse host configuration from TOML text. Missing keys take defaults.
pub fn from_toml_str(text: &str) -> Result<HostConfig, ConfigError> {
    let file: FileConfig = toml::from_str(text)?;
    let memory_limit = file
        .memory_limit
        .unwrap_or_else(|| default_memory_limit(file.low_end_device))
        .max(1);
    let enforce_delay_ms = file
        .enforce_delay_ms
        .unwrap_or(ENFORCE_MEMORY_POLICY_DELAY_MS)
        .max(1);

    Ok(HostConfig {
        manager: ManagerConfig {
            memory_limit,
            enforce_delay_ms,
            runtime: None,
        },
        low_end_device: file.low_end_device,
        log: file.log,
    })
}

/// Load host configuration from a TOML file.
pub fn load_file(path: impl AsRef<Path>) -> Result<HostConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    from_toml_str(&text)
}
