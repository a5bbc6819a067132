// src/events.rs

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub timestamp: SystemTime,
    pub message: String,
    pub severity: Severity,
}

/// Capped, newest-first event log shown by the presentation layer.
///
/// Every entry is also emitted through `tracing` at the matching level.
#[derive(Debug)]
pub struct EventLog {
    entries: Mutex<VecDeque<LogEvent>>,
    limit: usize,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit)),
            limit: limit.max(1),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Severity::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Severity::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    pub fn push(&self, severity: Severity, message: String) {
        match severity {
            Severity::Info => tracing::info!(target: "throughput_engine::events", "{message}"),
            Severity::Warn => tracing::warn!(target: "throughput_engine::events", "{message}"),
            Severity::Error => tracing::error!(target: "throughput_engine::events", "{message}"),
        }

        let mut entries = self.entries.lock();
        entries.push_front(LogEvent {
            timestamp: SystemTime::now(),
            message,
            severity,
        });
        entries.truncate(self.limit);
    }

    /// Newest first.
    pub fn entries(&self) -> Vec<LogEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_entries() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.info(format!("event {i}"));
        }
        log.warn("last");

        let messages: Vec<_> = log.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["last", "event 4", "event 3"]);
        assert_eq!(log.entries()[0].severity, Severity::Warn);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn entries_are_mirrored_to_tracing() {
        let log = EventLog::new(8);
        log.warn("Tailnet server unreachable");
        assert!(logs_contain("Tailnet server unreachable"));
    }
}
