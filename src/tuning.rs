// src/tuning.rs
//
// Adaptive tuning: effective bounds, trend following, bursts and chunk sizing.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::profiles::AggressionPreset;
use crate::stats::{BestSnapshot, StatsWindow};

/// Samples considered by one tuning pass.
const TREND_WINDOW: usize = 8;
/// Fewer samples than this and the pass only checks burst expiry.
const MIN_TREND_SAMPLES: usize = 4;
/// Chunks considered when judging chunk duration.
const CHUNK_WINDOW: usize = 10;
const TREND_UP_STEP: usize = 2;
const TREND_DOWN_STEP: usize = 1;

/// Inclusive limits the worker target and chunk size must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min_workers: usize,
    pub max_workers: usize,
    pub min_chunk_mb: u64,
    pub max_chunk_mb: u64,
}

impl Bounds {
    pub fn contains(&self, workers: usize, chunk_mb: u64) -> bool {
        (self.min_workers..=self.max_workers).contains(&workers)
            && (self.min_chunk_mb..=self.max_chunk_mb).contains(&chunk_mb)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BurstState {
    pub active: bool,
    pub until: Option<Instant>,
    pub last_triggered: Option<Instant>,
}

/// Mutable tuning knobs shared by the tuner, the pool and the selector.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningState {
    pub worker_target: usize,
    pub chunk_mb: u64,
    pub preset: AggressionPreset,
    pub burst: BurstState,
}

impl TuningState {
    pub fn new(preset: AggressionPreset) -> Self {
        Self {
            worker_target: preset.min_workers,
            chunk_mb: preset.min_chunk_mb,
            preset,
            burst: BurstState::default(),
        }
    }

    /// The preset's own limits, without any flex.
    pub fn base_bounds(&self) -> Bounds {
        Bounds {
            min_workers: self.preset.min_workers,
            max_workers: self.preset.max_workers.max(self.preset.min_workers),
            min_chunk_mb: self.preset.min_chunk_mb,
            max_chunk_mb: self.preset.max_chunk_mb.max(self.preset.min_chunk_mb),
        }
    }

    pub fn clamp_to(&mut self, bounds: Bounds) {
        self.worker_target = self.worker_target.clamp(bounds.min_workers, bounds.max_workers);
        self.chunk_mb = self.chunk_mb.clamp(bounds.min_chunk_mb, bounds.max_chunk_mb);
    }
}

/// One change made by a tuning pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Adjustment {
    BurstExpired { workers: usize, chunk_mb: u64 },
    WorkersRaised { from: usize, to: usize },
    WorkersLowered { from: usize, to: usize },
    BurstStarted { workers: usize, chunk_mb: u64 },
    ChunkGrown { from: u64, to: u64 },
    ChunkShrunk { from: u64, to: u64 },
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::BurstExpired { workers, chunk_mb } => {
                write!(f, "Burst cooled down ({workers} streams, {chunk_mb} MB)")
            }
            Adjustment::WorkersRaised { to, .. } => write!(f, "Active stream target -> {to} (trend up)"),
            Adjustment::WorkersLowered { to, .. } => write!(f, "Active stream target -> {to} (trend dip)"),
            Adjustment::BurstStarted { workers, chunk_mb } => {
                write!(f, "Burst mode engaged (throughput sag): {workers} streams, {chunk_mb} MB")
            }
            Adjustment::ChunkGrown { to, .. } => write!(f, "Chunk size -> {to} MB (chunks finishing fast)"),
            Adjustment::ChunkShrunk { to, .. } => write!(f, "Chunk size -> {to} MB (chunks dragging)"),
        }
    }
}

/// Tuning policy derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct AdaptiveTuner {
    trend_threshold: f64,
    chunk_step_mb: u64,
    absolute_worker_cap: usize,
    absolute_chunk_cap_mb: u64,
    burst_extra_workers: usize,
    burst_chunk_boost_mb: u64,
    burst_worker_step: usize,
    burst_duration: Duration,
    burst_cooldown: Duration,
    burst_speed_drop: f64,
    reachable_extra_workers: usize,
    reachable_chunk_boost_mb: u64,
    fast_chunk_secs: f64,
    slow_chunk_secs: f64,
}

impl AdaptiveTuner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            trend_threshold: config.trend_threshold,
            chunk_step_mb: config.chunk_step_mb,
            absolute_worker_cap: config.absolute_worker_cap,
            absolute_chunk_cap_mb: config.absolute_chunk_cap_mb,
            burst_extra_workers: config.burst_extra_workers,
            burst_chunk_boost_mb: config.burst_chunk_boost_mb,
            burst_worker_step: config.burst_worker_step,
            burst_duration: config.burst_duration(),
            burst_cooldown: config.burst_cooldown(),
            burst_speed_drop: config.burst_speed_drop,
            reachable_extra_workers: config.reachable_extra_workers,
            reachable_chunk_boost_mb: config.reachable_chunk_boost_mb,
            fast_chunk_secs: config.fast_chunk_secs,
            slow_chunk_secs: config.slow_chunk_secs,
        }
    }

    /// Preset bounds extended by reachability and burst flex, capped absolutely.
    pub fn effective_bounds(&self, state: &TuningState, reachable: bool) -> Bounds {
        let base = state.base_bounds();
        let mut extra_workers = 0;
        let mut extra_chunk = 0;
        if reachable {
            extra_workers += self.reachable_extra_workers;
            extra_chunk += self.reachable_chunk_boost_mb;
        }
        if state.burst.active {
            extra_workers += self.burst_extra_workers;
            extra_chunk += self.burst_chunk_boost_mb;
        }

        Bounds {
            min_workers: base.min_workers,
            max_workers: (base.max_workers + extra_workers)
                .min(self.absolute_worker_cap)
                .max(base.min_workers),
            min_chunk_mb: base.min_chunk_mb,
            max_chunk_mb: (base.max_chunk_mb + extra_chunk)
                .min(self.absolute_chunk_cap_mb)
                .max(base.min_chunk_mb),
        }
    }

    pub fn clamp(&self, state: &mut TuningState, reachable: bool) {
        let bounds = self.effective_bounds(state, reachable);
        state.clamp_to(bounds);
    }

    /// Switch presets, keeping the current values clamped into the new bounds.
    pub fn apply_preset(&self, state: &mut TuningState, preset: AggressionPreset, reachable: bool) {
        state.preset = preset;
        self.clamp(state, reachable);
    }

    /// End an expired burst and pull the values back inside the preset's own bounds.
    pub fn expire_burst(&self, state: &mut TuningState, now: Instant) -> Option<Adjustment> {
        let expired = state.burst.active && state.burst.until.is_some_and(|until| now >= until);
        if !expired {
            return None;
        }
        state.burst.active = false;
        state.burst.until = None;
        state.clamp_to(state.base_bounds());
        Some(Adjustment::BurstExpired {
            workers: state.worker_target,
            chunk_mb: state.chunk_mb,
        })
    }

    /// Try to start a burst. Refused while one is active or within the cooldown.
    pub fn start_burst(&self, state: &mut TuningState, reachable: bool, now: Instant) -> Option<Adjustment> {
        let cooling = state
            .burst
            .last_triggered
            .is_some_and(|last| now.saturating_duration_since(last) < self.burst_cooldown);
        if state.burst.active || cooling {
            return None;
        }

        state.burst = BurstState {
            active: true,
            until: Some(now + self.burst_duration),
            last_triggered: Some(now),
        };
        let bounds = self.effective_bounds(state, reachable);
        state.worker_target = (state.worker_target + self.burst_worker_step)
            .clamp(bounds.min_workers, bounds.max_workers);
        state.chunk_mb = (state.chunk_mb + self.chunk_step_mb).clamp(bounds.min_chunk_mb, bounds.max_chunk_mb);

        Some(Adjustment::BurstStarted {
            workers: state.worker_target,
            chunk_mb: state.chunk_mb,
        })
    }

    /// One tuning pass. At most one adjustment besides a burst expiry is made.
    pub fn tick(
        &self,
        state: &mut TuningState,
        window: &mut StatsWindow,
        reachable: bool,
        now: Instant,
    ) -> Vec<Adjustment> {
        let mut adjustments: Vec<Adjustment> = self.expire_burst(state, now).into_iter().collect();
        self.clamp(state, reachable);

        let speeds = window.recent_speeds(TREND_WINDOW);
        if speeds.len() < MIN_TREND_SAMPLES {
            return adjustments;
        }

        let average = speeds.iter().sum::<f64>() / speeds.len() as f64;
        let best_speed = window.best.map_or(0.0, |best| best.speed_mbps);
        if average > best_speed {
            window.best = Some(BestSnapshot {
                speed_mbps: average,
                workers: state.worker_target,
                chunk_mb: state.chunk_mb,
            });
        }

        if let Some(adjustment) = self.follow_trend(state, &speeds, reachable) {
            adjustments.push(adjustment);
            return adjustments;
        }

        let best_speed = window.best.map_or(0.0, |best| best.speed_mbps);
        let slowest = speeds.iter().copied().fold(f64::INFINITY, f64::min);
        if best_speed > 0.0 && slowest < best_speed * self.burst_speed_drop {
            if let Some(adjustment) = self.start_burst(state, reachable, now) {
                adjustments.push(adjustment);
                return adjustments;
            }
        }

        if let Some(adjustment) = self.resize_chunks(state, window.average_chunk_secs(CHUNK_WINDOW), reachable) {
            adjustments.push(adjustment);
        }
        adjustments
    }

    fn follow_trend(&self, state: &mut TuningState, speeds: &[f64], reachable: bool) -> Option<Adjustment> {
        let (first, last) = (speeds.first()?, speeds.last()?);
        let trend = last - first;
        let bounds = self.effective_bounds(state, reachable);
        let from = state.worker_target;

        if trend > self.trend_threshold && from < bounds.max_workers {
            state.worker_target = (from + TREND_UP_STEP).min(bounds.max_workers);
            return Some(Adjustment::WorkersRaised { from, to: state.worker_target });
        }
        if trend < -self.trend_threshold && from > bounds.min_workers {
            state.worker_target = from.saturating_sub(TREND_DOWN_STEP).max(bounds.min_workers);
            return Some(Adjustment::WorkersLowered { from, to: state.worker_target });
        }
        None
    }

    fn resize_chunks(&self, state: &mut TuningState, average_secs: Option<f64>, reachable: bool) -> Option<Adjustment> {
        let average = average_secs.filter(|secs| *secs > 0.0)?;
        let bounds = self.effective_bounds(state, reachable);
        let from = state.chunk_mb;

        if average < self.fast_chunk_secs && from < bounds.max_chunk_mb {
            state.chunk_mb = (from + self.chunk_step_mb).min(bounds.max_chunk_mb);
            return Some(Adjustment::ChunkGrown { from, to: state.chunk_mb });
        }
        if average > self.slow_chunk_secs && from > bounds.min_chunk_mb {
            state.chunk_mb = from.saturating_sub(self.chunk_step_mb).max(bounds.min_chunk_mb);
            return Some(Adjustment::ChunkShrunk { from, to: state.chunk_mb });
        }
        None
    }

    /// Raise the worker target to `round(downlink × 3)` when that is higher.
    pub fn apply_bandwidth_hint(&self, state: &mut TuningState, downlink_mbps: f64, reachable: bool) -> bool {
        if downlink_mbps.is_nan() || downlink_mbps <= 0.0 {
            return false;
        }
        let bounds = self.effective_bounds(state, reachable);
        let suggested = ((downlink_mbps * 3.0).round() as usize).clamp(bounds.min_workers, bounds.max_workers);
        if suggested > state.worker_target {
            state.worker_target = suggested;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::models::ChunkResult;
    use crate::profiles::ProfileStore;
    use crate::stats::SpeedSample;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tuner() -> AdaptiveTuner {
        AdaptiveTuner::new(&EngineConfig::default())
    }

    fn state(preset: &str) -> TuningState {
        TuningState::new(ProfileStore::builtin().preset(preset).unwrap().clone())
    }

    fn window_with(speeds: &[f64], start: Instant) -> StatsWindow {
        let mut window = StatsWindow::new(160, 80);
        for (i, speed) in speeds.iter().enumerate() {
            window.push_sample(SpeedSample {
                at: start + Duration::from_secs(i as u64),
                speed_mbps: *speed,
                workers: 1,
            });
        }
        window
    }

    fn rising() -> Vec<f64> {
        (0..8).map(|i| 10.0 + i as f64 * 0.1).collect()
    }

    #[test]
    fn effective_bounds_add_flex_and_respect_caps() {
        let tuner = tuner();
        let mut ludicrous = state("ludicrous");

        assert_eq!(tuner.effective_bounds(&ludicrous, false).max_workers, 40);
        assert_eq!(tuner.effective_bounds(&ludicrous, true).max_workers, 46);
        assert_eq!(tuner.effective_bounds(&ludicrous, true).max_chunk_mb, 320);

        ludicrous.burst.active = true;
        let bounds = tuner.effective_bounds(&ludicrous, true);
        assert_eq!(bounds.max_workers, 56);
        assert_eq!(bounds.max_chunk_mb, 448);
        assert_eq!(bounds.min_workers, 18);
    }

    #[test]
    fn rising_trend_adds_two_workers() {
        let tuner = tuner();
        let now = Instant::now();
        let mut tuning = state("ludicrous");
        tuning.worker_target = 20;
        let mut window = window_with(&rising(), now);

        let adjustments = tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(adjustments, vec![Adjustment::WorkersRaised { from: 20, to: 22 }]);

        tuning.worker_target = 39;
        tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(tuning.worker_target, 40);

        let adjustments = tuner.tick(&mut tuning, &mut window, false, now);
        assert!(adjustments.is_empty());
        assert_eq!(tuning.worker_target, 40);
    }

    #[test]
    fn falling_trend_removes_one_worker() {
        let tuner = tuner();
        let now = Instant::now();
        let mut speeds = rising();
        speeds.reverse();
        let mut window = window_with(&speeds, now);

        let mut tuning = state("eco");
        tuning.worker_target = 9;
        let adjustments = tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(adjustments, vec![Adjustment::WorkersLowered { from: 9, to: 8 }]);

        tuning.worker_target = 4;
        assert!(tuner.tick(&mut tuning, &mut window, false, now).is_empty());
        assert_eq!(tuning.worker_target, 4);
    }

    #[test]
    fn too_few_samples_skip_tuning() {
        let tuner = tuner();
        let now = Instant::now();
        let mut window = window_with(&[1.0, 5.0, 9.0], now);
        let mut tuning = state("balanced");
        assert!(tuner.tick(&mut tuning, &mut window, false, now).is_empty());
        assert!(window.best.is_none());
    }

    #[test]
    fn best_average_remembers_configuration() {
        let tuner = tuner();
        let now = Instant::now();
        let mut window = window_with(&[5.0; 8], now);
        let mut tuning = state("balanced");
        tuning.chunk_mb = 48;
        tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(
            window.best,
            Some(BestSnapshot { speed_mbps: 5.0, workers: 10, chunk_mb: 48 })
        );
    }

    fn sagging_window(now: Instant) -> StatsWindow {
        let mut window = window_with(&[6.0, 6.0, 2.0, 6.0], now);
        window.best = Some(BestSnapshot { speed_mbps: 10.0, workers: 20, chunk_mb: 32 });
        window
    }

    #[test]
    fn burst_is_refused_within_cooldown() {
        let tuner = tuner();
        let t0 = Instant::now();
        let mut tuning = state("ludicrous");
        tuning.worker_target = 30;
        tuning.chunk_mb = 64;

        let first = tuner.tick(&mut tuning, &mut sagging_window(t0), false, t0);
        assert_eq!(first, vec![Adjustment::BurstStarted { workers: 34, chunk_mb: 80 }]);
        assert!(tuning.burst.active);

        let second = tuner.tick(&mut tuning, &mut sagging_window(t0), false, t0 + Duration::from_secs(10));
        assert!(!second.iter().any(|a| matches!(a, Adjustment::BurstStarted { .. })));

        // expired after 20s but still cooling down until 45s
        let third = tuner.tick(&mut tuning, &mut sagging_window(t0), false, t0 + Duration::from_secs(30));
        assert!(matches!(third[0], Adjustment::BurstExpired { .. }));
        assert!(!third.iter().any(|a| matches!(a, Adjustment::BurstStarted { .. })));

        let fourth = tuner.tick(&mut tuning, &mut sagging_window(t0), false, t0 + Duration::from_secs(46));
        assert!(fourth.iter().any(|a| matches!(a, Adjustment::BurstStarted { .. })));
    }

    #[test]
    fn burst_expiry_clamps_back_to_base_bounds() {
        let tuner = tuner();
        let t0 = Instant::now();
        let mut tuning = state("ludicrous");
        tuning.worker_target = 40;
        tuning.chunk_mb = 256;

        tuner.start_burst(&mut tuning, true, t0).unwrap();
        assert_eq!((tuning.worker_target, tuning.chunk_mb), (44, 272));
        tuning.worker_target = 56;
        tuning.chunk_mb = 448;

        assert!(tuner.expire_burst(&mut tuning, t0 + Duration::from_secs(19)).is_none());
        let expired = tuner.expire_burst(&mut tuning, t0 + Duration::from_secs(20)).unwrap();
        assert_eq!(expired, Adjustment::BurstExpired { workers: 40, chunk_mb: 256 });
        assert!(!tuning.burst.active);
        assert!(tuning.base_bounds().contains(tuning.worker_target, tuning.chunk_mb));
    }

    #[test]
    fn chunk_size_follows_chunk_duration() {
        let tuner = tuner();
        let now = Instant::now();
        let mut tuning = state("balanced");
        tuning.chunk_mb = 64;

        let mut window = window_with(&[5.0; 8], now);
        for _ in 0..3 {
            window.push_chunk(ChunkResult {
                encoded_bytes: 64 * MIB,
                logical_bytes: 64 * MIB,
                duration: Duration::from_millis(300),
                source_id: "bbb".into(),
            });
        }
        let adjustments = tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(adjustments, vec![Adjustment::ChunkGrown { from: 64, to: 80 }]);

        for _ in 0..10 {
            window.push_chunk(ChunkResult {
                encoded_bytes: 64 * MIB,
                logical_bytes: 64 * MIB,
                duration: Duration::from_secs(12),
                source_id: "bbb".into(),
            });
        }
        let adjustments = tuner.tick(&mut tuning, &mut window, false, now);
        assert_eq!(adjustments, vec![Adjustment::ChunkShrunk { from: 80, to: 64 }]);
    }

    #[test]
    fn switching_presets_clamps_instead_of_resetting() {
        let tuner = tuner();
        let store = ProfileStore::builtin();
        let mut tuning = state("ludicrous");
        tuning.worker_target = 30;
        tuning.chunk_mb = 200;

        tuner.apply_preset(&mut tuning, store.preset("eco").unwrap().clone(), false);
        assert_eq!((tuning.worker_target, tuning.chunk_mb), (14, 64));

        tuner.apply_preset(&mut tuning, store.preset("balanced").unwrap().clone(), false);
        assert_eq!((tuning.worker_target, tuning.chunk_mb), (14, 64));
    }

    #[test]
    fn bandwidth_hint_only_raises() {
        let tuner = tuner();
        let mut tuning = state("balanced");
        assert!(tuner.apply_bandwidth_hint(&mut tuning, 5.0, false));
        assert_eq!(tuning.worker_target, 15);
        assert!(!tuner.apply_bandwidth_hint(&mut tuning, 2.0, false));
        assert!(tuner.apply_bandwidth_hint(&mut tuning, 100.0, false));
        assert_eq!(tuning.worker_target, 26);
        assert!(!tuner.apply_bandwidth_hint(&mut tuning, f64::NAN, false));
    }

    #[test]
    fn values_stay_within_effective_bounds() {
        let tuner = tuner();
        let store = ProfileStore::builtin();
        let mut rng = StdRng::seed_from_u64(42);
        let t0 = Instant::now();

        for preset in store.presets() {
            for reachable in [false, true] {
                let mut tuning = TuningState::new(preset.clone());
                let mut window = StatsWindow::new(160, 80);
                let mut now = t0;

                for step in 0..400 {
                    now += Duration::from_secs(5);
                    window.push_sample(SpeedSample {
                        at: now,
                        speed_mbps: rng.gen_range(0.0..50.0),
                        workers: tuning.worker_target,
                    });
                    window.push_chunk(ChunkResult {
                        encoded_bytes: MIB,
                        logical_bytes: MIB,
                        duration: Duration::from_secs_f64(rng.gen_range(0.1..12.0)),
                        source_id: "x".into(),
                    });

                    match step % 50 {
                        17 => {
                            tuner.start_burst(&mut tuning, reachable, now);
                        }
                        33 => {
                            let next = &store.presets()[rng.gen_range(0..store.presets().len())];
                            tuner.apply_preset(&mut tuning, next.clone(), reachable);
                        }
                        _ => {
                            tuner.tick(&mut tuning, &mut window, reachable, now);
                        }
                    }

                    let bounds = tuner.effective_bounds(&tuning, reachable);
                    assert!(
                        bounds.contains(tuning.worker_target, tuning.chunk_mb),
                        "{:?} outside {bounds:?}",
                        (tuning.worker_target, tuning.chunk_mb)
                    );
                    assert!(bounds.max_workers <= 56 && bounds.max_chunk_mb <= 512);
                }
            }
        }
    }
}
