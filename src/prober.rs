// src/prober.rs
//
// Periodic HEAD probe of the fast-local host.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::ReachabilityConfig;
use crate::models::{ReachabilityGroup, SourceDescriptor};
use crate::registry::SourceRegistry;
use crate::selector::ReachabilityView;
use crate::transport::{TransferError, Transport};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Another probe was already in flight.
    Skipped,
    /// Nothing changed; carries the current availability.
    Unchanged(bool),
    BecameAvailable { supports_range: bool },
    BecameUnavailable { reason: String },
}

impl ProbeOutcome {
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::BecameAvailable { .. } | ProbeOutcome::BecameUnavailable { .. }
        )
    }
}

/// Clears the in-flight flag however the probe ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tracks whether the fast-local group is reachable.
#[derive(Debug)]
pub struct ReachabilityProber {
    config: ReachabilityConfig,
    available: AtomicBool,
    supports_range: AtomicBool,
    in_flight: AtomicBool,
    source_ids: RwLock<Vec<String>>,
    last_error: Mutex<Option<String>>,
}

impl ReachabilityProber {
    pub fn new(config: ReachabilityConfig) -> Self {
        Self {
            config,
            available: AtomicBool::new(false),
            supports_range: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            source_ids: RwLock::new(Vec::new()),
            last_error: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReachabilityConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn supports_range(&self) -> bool {
        self.supports_range.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn view(&self) -> ReachabilityView {
        ReachabilityView {
            available: self.is_available(),
            source_ids: self.source_ids.read().clone(),
        }
    }

    /// Descriptors of the fast-local files, as registered after a successful probe.
    pub fn descriptors(&self, supports_range: bool) -> Vec<SourceDescriptor> {
        self.config
            .files
            .iter()
            .map(|file| {
                SourceDescriptor::new(&file.id, &file.label, &format!("{}{}", self.config.base_url, file.path))
                    .with_size(file.size_bytes)
                    .with_range(supports_range)
                    .with_weight(self.config.source_weight)
                    .in_group(ReachabilityGroup::FastLocal)
            })
            .collect()
    }

    /// Run one HEAD check. Concurrent calls are skipped rather than queued.
    ///
    /// A successful probe (re)registers the fast-local sources every time;
    /// availability only flips on an actual transition.
    pub async fn probe(&self, transport: &dyn Transport, registry: &SourceRegistry) -> ProbeOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("probe already in flight");
            return ProbeOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        match self.check(transport).await {
            Ok(supports_range) => {
                let descriptors = self.descriptors(supports_range);
                let ids: Vec<String> = descriptors.iter().map(|d| d.id.clone()).collect();
                for descriptor in descriptors {
                    registry.register(descriptor);
                }
                self.supports_range.store(supports_range, Ordering::SeqCst);
                self.last_error.lock().take();

                if self.available.swap(true, Ordering::SeqCst) {
                    ProbeOutcome::Unchanged(true)
                } else {
                    *self.source_ids.write() = ids;
                    ProbeOutcome::BecameAvailable { supports_range }
                }
            }
            Err(err) => {
                let reason = err.to_string();
                debug!(error = %reason, "fast-local probe failed");
                *self.last_error.lock() = Some(reason.clone());

                if self.available.swap(false, Ordering::SeqCst) {
                    self.source_ids.write().clear();
                    ProbeOutcome::BecameUnavailable { reason }
                } else {
                    ProbeOutcome::Unchanged(false)
                }
            }
        }
    }

    async fn check(&self, transport: &dyn Transport) -> Result<bool, TransferError> {
        let target = self
            .config
            .probe_target()
            .ok_or(TransferError::NoSource)?;
        let url = format!("{target}?probe={}", now_millis());
        let timeout = self.config.probe_timeout();

        let response = tokio::time::timeout(timeout, transport.head(&url, timeout))
            .await
            .map_err(|_| TransferError::Timeout)??;
        if !response.is_success() {
            return Err(TransferError::Status(response.status));
        }
        Ok(response.supports_range())
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
