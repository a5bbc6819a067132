// src/models.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::MIB;

/// Which reachability group a source belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ReachabilityGroup {
    /// Always assumed reachable.
    #[default]
    Public,
    /// Low-latency endpoints that are only usable while the prober sees them.
    FastLocal,
}

/// A fetchable endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDescriptor {
    pub id: String,
    pub label: String,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub supports_range: bool,
    /// Relative selection bias.
    pub weight: f64,
    pub group: ReachabilityGroup,
    /// Universal fallback, always appended to the allowed pool.
    #[serde(default)]
    pub fallback: bool,
    /// Exponential moving average of the observed MB/s.
    #[serde(default)]
    pub performance: Option<f64>,
}

impl SourceDescriptor {
    pub fn new(id: &str, label: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            url: url.to_string(),
            size_bytes: None,
            supports_range: false,
            weight: 1.0,
            group: ReachabilityGroup::Public,
            fallback: false,
            performance: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_range(mut self, supports_range: bool) -> Self {
        self.supports_range = supports_range;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn in_group(mut self, group: ReachabilityGroup) -> Self {
        self.group = group;
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }
}

/// Inclusive byte range, rendered as an HTTP `Range` header value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// One request, built by the selector and consumed by a single worker iteration.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub source: SourceDescriptor,
    pub url: String,
    pub range: Option<ByteRange>,
    pub chunk_bytes: u64,
}

/// Outcome of one (possibly partial) transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    /// Bytes on the wire, from the declared content length when present.
    pub encoded_bytes: u64,
    /// Payload bytes actually read.
    pub logical_bytes: u64,
    pub duration: Duration,
    pub source_id: String,
}

impl ChunkResult {
    /// Observed throughput in MiB/s, `None` when no time elapsed.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let secs = self.duration.as_secs_f64();
        (secs > 0.0).then(|| self.encoded_bytes as f64 / secs / MIB as f64)
    }
}

/// Coarse lifecycle of the engine as shown to the presentation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    Idle,
    /// Started but no throughput sample recorded yet.
    Calibrating,
    Running,
    Paused,
}

/// Cumulative transfer totals for one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceTotal {
    pub id: String,
    pub label: String,
    pub bytes: u64,
    pub hits: u64,
}

/// Read-only view handed to the presentation layer on every stats tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub status: EngineStatus,
    pub instantaneous_speed_mbps: f64,
    pub peak_speed_mbps: f64,
    pub total_bytes: u64,
    pub logical_bytes: u64,
    pub active_workers: usize,
    pub worker_target: usize,
    pub chunk_size_mb: u64,
    pub burst_active: bool,
    pub reachability_available: bool,
    pub top_sources: Vec<SourceTotal>,
    pub session_duration_ms: u64,
}

impl EngineSnapshot {
    /// Session duration as `HH:MM:SS`.
    pub fn session_clock(&self) -> String {
        let total = self.session_duration_ms / 1000;
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
        assert_eq!(range.header_value(), "bytes=10-19");
    }

    #[test]
    fn throughput_needs_elapsed_time() {
        let mut chunk = ChunkResult {
            encoded_bytes: 4 * MIB,
            logical_bytes: 4 * MIB,
            duration: Duration::from_secs(2),
            source_id: "bbb".into(),
        };
        assert_eq!(chunk.throughput_mbps(), Some(2.0));
        chunk.duration = Duration::ZERO;
        assert_eq!(chunk.throughput_mbps(), None);
    }

    #[test]
    fn session_clock_formats_hours() {
        let snapshot = EngineSnapshot {
            session_duration_ms: 3_723_000,
            ..Default::default()
        };
        assert_eq!(snapshot.session_clock(), "01:02:03");
    }
}
