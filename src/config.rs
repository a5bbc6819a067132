// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * KIB;
pub const GIB: u64 = MIB * KIB;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Every interval, window size and limit the engine works with.
///
/// Durations are stored as milliseconds so that the struct maps one to one onto
/// a JSON document; missing fields fall back to [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stats_interval_ms: u64,
    pub adapt_interval_ms: u64,
    pub maintain_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest wait for response headers.
    pub request_timeout_ms: u64,
    /// Longest gap between two body reads before the transfer is abandoned.
    pub read_idle_timeout_ms: u64,

    pub chunk_history_limit: usize,
    pub speed_history_limit: usize,
    pub log_limit: usize,
    /// Number of sources reported in snapshots.
    pub top_sources: usize,

    pub chunk_step_mb: u64,
    pub trend_threshold: f64,
    pub absolute_worker_cap: usize,
    pub absolute_chunk_cap_mb: u64,

    pub burst_extra_workers: usize,
    pub burst_chunk_boost_mb: u64,
    pub burst_worker_step: usize,
    pub burst_duration_ms: u64,
    pub burst_cooldown_ms: u64,
    pub burst_speed_drop: f64,

    pub reachable_extra_workers: usize,
    pub reachable_chunk_boost_mb: u64,

    pub fast_chunk_secs: f64,
    pub slow_chunk_secs: f64,
    pub score_smoothing: f64,

    pub default_preset: String,
    pub default_profile: String,
    pub fallback_source: String,

    pub reachability: ReachabilityConfig,
}

/// Where the fast-local source group lives and how it is probed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub base_url: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub source_weight: f64,
    pub files: Vec<FastLocalFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLocalFile {
    pub id: String,
    pub label: String,
    pub path: String,
    pub size_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 1_000,
            adapt_interval_ms: 5_000,
            maintain_interval_ms: 900,
            retry_backoff_ms: 400,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            read_idle_timeout_ms: 15_000,
            chunk_history_limit: 80,
            speed_history_limit: 160,
            log_limit: 40,
            top_sources: 3,
            chunk_step_mb: 16,
            trend_threshold: 0.2,
            absolute_worker_cap: 56,
            absolute_chunk_cap_mb: 512,
            burst_extra_workers: 10,
            burst_chunk_boost_mb: 128,
            burst_worker_step: 4,
            burst_duration_ms: 20_000,
            burst_cooldown_ms: 45_000,
            burst_speed_drop: 0.55,
            reachable_extra_workers: 6,
            reachable_chunk_boost_mb: 64,
            fast_chunk_secs: 0.8,
            slow_chunk_secs: 8.0,
            score_smoothing: 0.3,
            default_preset: "ludicrous".to_string(),
            default_profile: "auto".to_string(),
            fallback_source: "jsdelivr".to_string(),
            reachability: ReachabilityConfig::default(),
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        let file = |id: &str, label: &str, path: &str, mb: u64| FastLocalFile {
            id: id.to_string(),
            label: label.to_string(),
            path: path.to_string(),
            size_bytes: mb * MIB,
        };
        Self {
            base_url: "https://data.tahr-vibe.ts.net".to_string(),
            probe_interval_ms: 60_000,
            probe_timeout_ms: 4_500,
            source_weight: 6.0,
            files: vec![
                file("pi-50", "Tailnet 50 MB", "/50M.bin", 50),
                file("pi-200", "Tailnet 200 MB", "/200M.bin", 200),
                file("pi-500", "Tailnet 500 MB", "/500M.bin", 500),
                file("pi-1000", "Tailnet 1 GB", "/1G.bin", 1000),
            ],
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file, filling unspecified fields with defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn adapt_interval(&self) -> Duration {
        Duration::from_millis(self.adapt_interval_ms)
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_millis(self.maintain_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }

    pub fn burst_duration(&self) -> Duration {
        Duration::from_millis(self.burst_duration_ms)
    }

    pub fn burst_cooldown(&self) -> Duration {
        Duration::from_millis(self.burst_cooldown_ms)
    }
}

impl ReachabilityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// URL checked by the prober: the first fast-local file.
    pub fn probe_target(&self) -> Option<String> {
        self.files
            .first()
            .map(|file| format!("{}{}", self.base_url, file.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "adapt_interval_ms": 2500, "reachability": { "base_url": "http://10.0.0.2" } }"#,
        )
        .unwrap();

        assert_eq!(config.adapt_interval(), Duration::from_millis(2500));
        assert_eq!(config.maintain_interval_ms, 900);
        assert_eq!(config.read_idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.reachability.base_url, "http://10.0.0.2");
        assert_eq!(config.reachability.files.len(), 4);
        assert_eq!(
            config.reachability.probe_target().as_deref(),
            Some("http://10.0.0.2/50M.bin")
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
