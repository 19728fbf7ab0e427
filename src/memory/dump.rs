//! Memory dump snapshot for diagnostics tooling.

use serde::Serialize;

use crate::process::{ClientId, SegmentId};

use super::clock::Timestamp;

/// Snapshot of the manager's accounting and every live segment.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryDump {
    pub bytes_allocated: usize,
    pub memory_limit: usize,
    pub segments: Vec<SegmentDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentDump {
    /// `discardable/process_<client hex>/segment_<id>`.
    pub name: String,
    pub client: ClientId,
    pub segment_id: SegmentId,
    pub size_bytes: usize,
    pub last_used: Timestamp,
    /// Stable cross-process identifier for the segment.
    pub guid: String,
}

impl SegmentDump {
    pub fn new(client: ClientId, id: SegmentId, size_bytes: usize, last_used: Timestamp) -> Self {
        Self {
            name: dump_name(client, id),
            client,
            segment_id: id,
            size_bytes,
            last_used,
            guid: segment_guid(client, id),
        }
    }
}

impl MemoryDump {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Sum of segment sizes. Equals `bytes_allocated` for a consistent dump.
    pub fn total_segment_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }
}

/// Client ids are formatted as their 32-bit two's complement in hex, so the
/// host sentinel shows as `ffffffff`.
pub fn dump_name(client: ClientId, id: SegmentId) -> String {
    format!("discardable/process_{:x}/segment_{}", client.0 as u32, id.0)
}

pub fn segment_guid(client: ClientId, id: SegmentId) -> String {
    format!("discardable-x-process/{:x}/{}", client.0 as u32, id.0)
}
