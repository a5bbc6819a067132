// src/engine.rs

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::events::{EventLog, LogEvent};
use crate::models::{ChunkResult, EngineSnapshot, EngineStatus, RequestDescriptor, SourceTotal};
use crate::pool::{Reconciled, WorkerPool};
use crate::prober::{ProbeOutcome, ReachabilityProber};
use crate::profiles::{ProfileStore, SourceProfile};
use crate::registry::SourceRegistry;
use crate::selector::SourceSelector;
use crate::stats::StatsAggregator;
use crate::transport::Transport;
use crate::tuning::{AdaptiveTuner, TuningState};
use crate::worker::{self, WorkerPhase};

const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown aggression preset: {0}")]
    UnknownPreset(String),
    #[error("unknown source profile: {0}")]
    UnknownProfile(String),
}

/// Running time across start/stop cycles.
#[derive(Debug, Default)]
struct SessionClock {
    started: Option<Instant>,
    banked: Duration,
}

impl SessionClock {
    fn start(&mut self, now: Instant) {
        self.started.get_or_insert(now);
    }

    fn pause(&mut self, now: Instant) {
        if let Some(started) = self.started.take() {
            self.banked += now.saturating_duration_since(started);
        }
    }

    fn reset(&mut self, now: Instant) {
        self.banked = Duration::ZERO;
        if self.started.is_some() {
            self.started = Some(now);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.banked
            + self
                .started
                .map_or(Duration::ZERO, |started| now.saturating_duration_since(started))
    }
}

/// State shared by the engine handle, its control tasks and every worker.
pub(crate) struct Shared {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    registry: SourceRegistry,
    profiles: ProfileStore,
    selector: SourceSelector,
    prober: ReachabilityProber,
    tuner: AdaptiveTuner,
    tuning: Mutex<TuningState>,
    profile: Mutex<SourceProfile>,
    stats: StatsAggregator,
    pool: WorkerPool,
    events: EventLog,
    running: AtomicBool,
    status: Mutex<EngineStatus>,
    session: Mutex<SessionClock>,
    shutdown: Mutex<Option<CancellationToken>>,
    snapshots: watch::Sender<EngineSnapshot>,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &EventLog {
        &self.events
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn build_request(&self) -> Option<RequestDescriptor> {
        let chunk_mb = self.tuning.lock().chunk_mb;
        self.selector
            .build_request(&self.registry, chunk_mb, &mut rand::thread_rng())
    }

    pub(crate) fn record(&self, chunk: ChunkResult) {
        let source_id = chunk.source_id.clone();
        if let Some(score) = self.stats.record(chunk) {
            self.registry.set_performance(&source_id, score);
        }
    }

    /// Clamp the tuning state and, while running, bring the pool to its target.
    fn maintain(self: &Arc<Self>) {
        let target = {
            let mut tuning = self.tuning.lock();
            self.tuner.clamp(&mut tuning, self.prober.is_available());
            tuning.worker_target
        };
        if !self.is_running() {
            return;
        }

        let reconciled = self
            .pool
            .reconcile(target, |slot| tokio::spawn(worker::run(slot, Arc::clone(self))));
        if reconciled != Reconciled::default() {
            debug!(
                workers = target,
                spawned = reconciled.spawned,
                retired = reconciled.retired,
                "pool reconciled"
            );
        }
    }

    fn stats_tick(&self) {
        let running = self.is_running();
        self.stats
            .sample_tick(Instant::now(), self.pool.active_count(), running);
        if running {
            let mut status = self.status.lock();
            if *status == EngineStatus::Calibrating {
                *status = EngineStatus::Running;
            }
        }
        self.publish();
    }

    fn tune_tick(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        let now = Instant::now();
        let reachable = self.prober.is_available();
        let adjustments = {
            let mut tuning = self.tuning.lock();
            self.stats
                .with_window(|window| self.tuner.tick(&mut tuning, window, reachable, now))
        };
        if adjustments.is_empty() {
            return;
        }
        for adjustment in &adjustments {
            self.events.info(adjustment.to_string());
        }
        self.maintain();
    }

    async fn probe(self: &Arc<Self>) -> ProbeOutcome {
        let outcome = self.prober.probe(self.transport(), &self.registry).await;
        match &outcome {
            ProbeOutcome::BecameAvailable { supports_range } => {
                let pool = self.rederive_pool();
                self.events.info(format!(
                    "Tailnet server reachable, {} sources in rotation (ranges {})",
                    pool.len(),
                    if *supports_range { "on" } else { "off" }
                ));
                self.maintain();
            }
            ProbeOutcome::BecameUnavailable { reason } => {
                self.rederive_pool();
                self.events.warn(format!("Tailnet server unreachable: {reason}"));
                self.maintain();
            }
            ProbeOutcome::Skipped | ProbeOutcome::Unchanged(_) => {}
        }
        outcome
    }

    fn rederive_pool(&self) -> Vec<String> {
        let profile = self.profile.lock().clone();
        self.selector
            .rederive(&profile, &self.prober.view(), &self.registry)
    }

    fn snapshot(&self) -> EngineSnapshot {
        let (worker_target, chunk_size_mb, burst_active) = {
            let tuning = self.tuning.lock();
            (tuning.worker_target, tuning.chunk_mb, tuning.burst.active)
        };
        let top_sources = self
            .stats
            .top_sources(self.config.top_sources)
            .into_iter()
            .map(|(id, bytes, hits)| SourceTotal {
                label: self
                    .registry
                    .lookup(&id)
                    .map_or_else(|| id.clone(), |source| source.label),
                id,
                bytes,
                hits,
            })
            .collect();

        EngineSnapshot {
            status: *self.status.lock(),
            instantaneous_speed_mbps: self.stats.instantaneous_speed(),
            peak_speed_mbps: self.stats.peak_speed(),
            total_bytes: self.stats.total_wire_bytes(),
            logical_bytes: self.stats.total_logical_bytes(),
            active_workers: self.pool.active_count(),
            worker_target,
            chunk_size_mb,
            burst_active,
            reachability_available: self.prober.is_available(),
            top_sources,
            session_duration_ms: self.session.lock().elapsed(Instant::now()).as_millis() as u64,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Maintenance, stats and tuning tickers plus the prober, all tied to `shutdown`.
    fn spawn_control_tasks(self: &Arc<Self>, shutdown: &CancellationToken) {
        self.spawn_ticker("maintenance", self.config.maintain_interval(), true, shutdown, |s| s.maintain());
        self.spawn_ticker("stats", self.config.stats_interval(), false, shutdown, |s| s.stats_tick());
        self.spawn_ticker("tuning", self.config.adapt_interval(), false, shutdown, |s| s.tune_tick());
        self.spawn_prober(shutdown);
    }

    fn spawn_ticker<F>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        immediate: bool,
        shutdown: &CancellationToken,
        tick: F,
    ) where
        F: Fn(&Arc<Shared>) + Send + 'static,
    {
        let shared = Arc::clone(self);
        let shutdown = shutdown.clone();
        let period = period.max(MIN_TICK);

        tokio::spawn(async move {
            let first = if immediate { Instant::now() } else { Instant::now() + period };
            let mut ticker = time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => tick(&shared),
                }
            }
            debug!(task = name, "control task stopped");
        });
    }

    fn spawn_prober(self: &Arc<Self>, shutdown: &CancellationToken) {
        let shared = Arc::clone(self);
        let shutdown = shutdown.clone();
        let period = self.prober.config().probe_interval().max(MIN_TICK);

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = shared.probe() => {}
                        }
                    }
                }
            }
            debug!(task = "prober", "control task stopped");
        });
    }
}

/// Handle to one adaptive throughput engine.
///
/// Dropping the handle stops the engine.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Engine over the built-in catalog and presets.
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self, EngineError> {
        let registry = SourceRegistry::with_builtin_catalog(&config.fallback_source);
        Self::with_catalog(config, transport, registry, ProfileStore::builtin())
    }

    pub fn with_catalog(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        registry: SourceRegistry,
        profiles: ProfileStore,
    ) -> Result<Self, EngineError> {
        let preset = profiles
            .preset(&config.default_preset)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPreset(config.default_preset.clone()))?;
        let profile = profiles
            .profile(&config.default_profile)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProfile(config.default_profile.clone()))?;

        let selector = SourceSelector::new(config.fallback_source.clone());
        let prober = ReachabilityProber::new(config.reachability.clone());
        selector.rederive(&profile, &prober.view(), &registry);
        let (snapshots, _) = watch::channel(EngineSnapshot::default());

        let shared = Arc::new(Shared {
            tuner: AdaptiveTuner::new(&config),
            tuning: Mutex::new(TuningState::new(preset)),
            profile: Mutex::new(profile),
            stats: StatsAggregator::new(
                config.speed_history_limit,
                config.chunk_history_limit,
                config.score_smoothing,
            ),
            pool: WorkerPool::new(),
            events: EventLog::new(config.log_limit),
            running: AtomicBool::new(false),
            status: Mutex::new(EngineStatus::Idle),
            session: Mutex::new(SessionClock::default()),
            shutdown: Mutex::new(None),
            config,
            transport,
            registry,
            profiles,
            selector,
            prober,
            snapshots,
        });
        shared.publish();
        Ok(Self { shared })
    }

    /// Spin up the control tasks. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        shared.session.lock().start(now);
        *shared.status.lock() = EngineStatus::Calibrating;
        shared.stats.rebaseline(now);

        let shutdown = CancellationToken::new();
        shared.spawn_control_tasks(&shutdown);
        if let Some(previous) = shared.shutdown.lock().replace(shutdown) {
            previous.cancel();
        }

        let (preset, workers) = {
            let tuning = shared.tuning.lock();
            (tuning.preset.id.clone(), tuning.worker_target)
        };
        info!(%preset, workers, "engine started");
        shared.events.info("Streams spooling up...");
        shared.publish();
    }

    /// Stop every task. In-flight requests are cancelled and never retried.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = shared.shutdown.lock().take() {
            shutdown.cancel();
        }
        let retired = shared.pool.retire_all();

        let now = Instant::now();
        shared.session.lock().pause(now);
        *shared.status.lock() = EngineStatus::Paused;
        shared.stats.sample_tick(now, 0, false);

        info!(retired, "engine stopped");
        shared.events.info("Streams paused.");
        shared.publish();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Zero counters, histories, peak, best-ever and performance scores.
    /// While running, the engine drops back to `Calibrating` until the next
    /// stats tick.
    pub fn reset_stats(&self) {
        let now = Instant::now();
        self.shared.stats.reset(now);
        self.shared.registry.clear_performance();
        self.shared.session.lock().reset(now);
        {
            let mut status = self.shared.status.lock();
            if self.shared.is_running() {
                *status = EngineStatus::Calibrating;
            }
        }
        self.shared.events.info("Counters reset.");
        self.shared.publish();
    }

    /// Switch the aggression preset, clamping the current values into it.
    pub fn set_policy(&self, id: &str) -> Result<(), EngineError> {
        let preset = self
            .shared
            .profiles
            .preset(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPreset(id.to_string()))?;
        let label = preset.label.clone();
        {
            let mut tuning = self.shared.tuning.lock();
            self.shared
                .tuner
                .apply_preset(&mut tuning, preset, self.shared.prober.is_available());
        }
        self.shared.events.info(format!("Aggression preset -> {label}"));
        self.shared.maintain();
        self.shared.publish();
        Ok(())
    }

    /// Switch the source mix and re-derive the allowed pool.
    pub fn set_source_profile(&self, id: &str) -> Result<(), EngineError> {
        let profile = self
            .shared
            .profiles
            .profile(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProfile(id.to_string()))?;
        let label = profile.label.clone();
        *self.shared.profile.lock() = profile;
        let pool = self.shared.rederive_pool();
        self.shared
            .events
            .info(format!("Source mix -> {label} ({} sources)", pool.len()));
        self.shared.publish();
        Ok(())
    }

    /// Raise the worker target from a downlink estimate. Returns whether it changed.
    pub fn apply_bandwidth_hint(&self, downlink_mbps: f64) -> bool {
        let raised = {
            let mut tuning = self.shared.tuning.lock();
            self.shared
                .tuner
                .apply_bandwidth_hint(&mut tuning, downlink_mbps, self.shared.prober.is_available())
                .then_some(tuning.worker_target)
        };
        match raised {
            Some(workers) => {
                self.shared.events.info(format!(
                    "Connection hint {downlink_mbps:.1} Mbps, stream target -> {workers}"
                ));
                self.shared.maintain();
                self.shared.publish();
                true
            }
            None => false,
        }
    }

    /// Probe the fast-local host right away, outside the periodic schedule.
    pub async fn probe_now(&self) -> ProbeOutcome {
        let outcome = self.shared.probe().await;
        self.shared.publish();
        outcome
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.shared.snapshot()
    }

    /// Receives a fresh snapshot on every stats tick and control action.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Newest first.
    pub fn log_events(&self) -> Vec<LogEvent> {
        self.shared.events.entries()
    }

    pub fn clear_log(&self) {
        self.shared.events.clear();
    }

    pub fn status(&self) -> EngineStatus {
        *self.shared.status.lock()
    }

    pub fn tuning(&self) -> TuningState {
        self.shared.tuning.lock().clone()
    }

    /// Ids the selector currently draws from, in priority order.
    pub fn allowed_sources(&self) -> Vec<String> {
        self.shared.selector.allowed()
    }

    /// Incremented each time the allowed pool is re-derived.
    pub fn pool_generation(&self) -> u64 {
        self.shared.selector.generation()
    }

    pub fn worker_phases(&self) -> Vec<(u64, WorkerPhase)> {
        self.shared.pool.phases()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.shared.registry
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.shared.profiles
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
