// src/stats.rs
//
// Throughput accounting: cumulative counters, rolling windows, per-source totals.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use crate::config::MIB;
use crate::models::ChunkResult;

/// Minimum elapsed time used when computing a speed sample.
const MIN_SAMPLE_SECS: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub at: Instant,
    pub speed_mbps: f64,
    pub workers: usize,
}

/// Best rolling average seen so far and the configuration that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestSnapshot {
    pub speed_mbps: f64,
    pub workers: usize,
    pub chunk_mb: u64,
}

/// Bounded histories consumed by the tuner.
#[derive(Debug, Clone)]
pub struct StatsWindow {
    speed_samples: VecDeque<SpeedSample>,
    chunk_history: VecDeque<ChunkResult>,
    speed_cap: usize,
    chunk_cap: usize,
    pub best: Option<BestSnapshot>,
}

impl StatsWindow {
    pub fn new(speed_cap: usize, chunk_cap: usize) -> Self {
        Self {
            speed_samples: VecDeque::with_capacity(speed_cap),
            chunk_history: VecDeque::with_capacity(chunk_cap),
            speed_cap: speed_cap.max(1),
            chunk_cap: chunk_cap.max(1),
            best: None,
        }
    }

    pub fn push_sample(&mut self, sample: SpeedSample) {
        self.speed_samples.push_back(sample);
        while self.speed_samples.len() > self.speed_cap {
            self.speed_samples.pop_front();
        }
    }

    pub fn push_chunk(&mut self, chunk: ChunkResult) {
        self.chunk_history.push_back(chunk);
        while self.chunk_history.len() > self.chunk_cap {
            self.chunk_history.pop_front();
        }
    }

    /// Speeds of the last `n` samples, oldest first.
    pub fn recent_speeds(&self, n: usize) -> Vec<f64> {
        let skip = self.speed_samples.len().saturating_sub(n);
        self.speed_samples.iter().skip(skip).map(|s| s.speed_mbps).collect()
    }

    /// Mean duration in seconds of the last `n` chunks.
    pub fn average_chunk_secs(&self, n: usize) -> Option<f64> {
        let skip = self.chunk_history.len().saturating_sub(n);
        let recent: Vec<f64> = self
            .chunk_history
            .iter()
            .skip(skip)
            .map(|c| c.duration.as_secs_f64())
            .collect();
        if recent.is_empty() {
            None
        } else {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &SpeedSample> {
        self.speed_samples.iter()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkResult> {
        self.chunk_history.iter()
    }

    pub fn clear(&mut self) {
        self.speed_samples.clear();
        self.chunk_history.clear();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SourceCounter {
    bytes: u64,
    hits: u64,
}

#[derive(Debug)]
struct SamplingState {
    window: StatsWindow,
    per_source: HashMap<String, SourceCounter>,
    performance: HashMap<String, f64>,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    current_speed: f64,
    peak_speed: f64,
}

/// Folds chunk results into counters and turns them into speed samples.
#[derive(Debug)]
pub struct StatsAggregator {
    wire_bytes: AtomicU64,
    logical_bytes: AtomicU64,
    smoothing: f64,
    state: Mutex<SamplingState>,
}

impl StatsAggregator {
    pub fn new(speed_cap: usize, chunk_cap: usize, smoothing: f64) -> Self {
        Self {
            wire_bytes: AtomicU64::new(0),
            logical_bytes: AtomicU64::new(0),
            smoothing,
            state: Mutex::new(SamplingState {
                window: StatsWindow::new(speed_cap, chunk_cap),
                per_source: HashMap::new(),
                performance: HashMap::new(),
                last_sample_at: Instant::now(),
                last_sample_bytes: 0,
                current_speed: 0.0,
                peak_speed: 0.0,
            }),
        }
    }

    /// Account for a finished transfer. Returns the source's updated performance score.
    ///
    /// Writers to the byte counters hold the state lock, so a concurrent
    /// [`reset`](Self::reset) never splits a chunk between the two.
    pub fn record(&self, chunk: ChunkResult) -> Option<f64> {
        let mut state = self.state.lock();
        self.wire_bytes.fetch_add(chunk.encoded_bytes, Ordering::Relaxed);
        self.logical_bytes.fetch_add(chunk.logical_bytes, Ordering::Relaxed);

        let counter = state.per_source.entry(chunk.source_id.clone()).or_default();
        counter.bytes += chunk.encoded_bytes;
        counter.hits += 1;

        let score = chunk.throughput_mbps().map(|throughput| {
            let next = match state.performance.get(&chunk.source_id) {
                Some(prev) => prev + self.smoothing * (throughput - prev),
                None => throughput,
            };
            state.performance.insert(chunk.source_id.clone(), next);
            next
        });

        state.window.push_chunk(chunk);
        score
    }

    /// Compute the speed since the previous tick and move the baseline forward.
    ///
    /// The sample only enters the rolling window when `record_sample` is set,
    /// so ticks taken while paused update the display without feeding the tuner.
    pub fn sample_tick(&self, now: Instant, workers: usize, record_sample: bool) -> f64 {
        let mut state = self.state.lock();
        let total = self.wire_bytes.load(Ordering::Relaxed);

        let elapsed = now
            .saturating_duration_since(state.last_sample_at)
            .as_secs_f64()
            .max(MIN_SAMPLE_SECS);
        let bytes = total.saturating_sub(state.last_sample_bytes);
        let speed = bytes as f64 / MIB as f64 / elapsed;

        state.current_speed = speed;
        state.peak_speed = state.peak_speed.max(speed);
        state.last_sample_at = now;
        state.last_sample_bytes = total;

        if record_sample {
            state.window.push_sample(SpeedSample {
                at: now,
                speed_mbps: speed,
                workers,
            });
        }
        speed
    }

    /// Start a new sampling session: fresh baseline, empty rolling windows.
    pub fn rebaseline(&self, now: Instant) {
        let mut state = self.state.lock();
        let total = self.wire_bytes.load(Ordering::Relaxed);
        state.last_sample_at = now;
        state.last_sample_bytes = total;
        state.window.clear();
    }

    /// Zero every counter and history, including peak and best-ever.
    pub fn reset(&self, now: Instant) {
        let mut state = self.state.lock();
        self.wire_bytes.store(0, Ordering::Relaxed);
        self.logical_bytes.store(0, Ordering::Relaxed);
        state.window.clear();
        state.window.best = None;
        state.per_source.clear();
        state.performance.clear();
        state.last_sample_at = now;
        state.last_sample_bytes = 0;
        state.current_speed = 0.0;
        state.peak_speed = 0.0;
    }

    pub fn with_window<T>(&self, f: impl FnOnce(&mut StatsWindow) -> T) -> T {
        f(&mut self.state.lock().window)
    }

    pub fn total_wire_bytes(&self) -> u64 {
        self.wire_bytes.load(Ordering::Relaxed)
    }

    pub fn total_logical_bytes(&self) -> u64 {
        self.logical_bytes.load(Ordering::Relaxed)
    }

    pub fn instantaneous_speed(&self) -> f64 {
        self.state.lock().current_speed
    }

    pub fn peak_speed(&self) -> f64 {
        self.state.lock().peak_speed
    }

    pub fn average_chunk_secs(&self, n: usize) -> Option<f64> {
        self.state.lock().window.average_chunk_secs(n)
    }

    pub fn performance(&self, source_id: &str) -> Option<f64> {
        self.state.lock().performance.get(source_id).copied()
    }

    /// `(id, bytes, hits)` of the `n` sources with the most bytes.
    pub fn top_sources(&self, n: usize) -> Vec<(String, u64, u64)> {
        let state = self.state.lock();
        let mut totals: Vec<_> = state
            .per_source
            .iter()
            .map(|(id, counter)| (id.clone(), counter.bytes, counter.hits))
            .collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        totals.truncate(n);
        totals
    }
}
