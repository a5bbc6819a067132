// src/selector.rs

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MIB;
use crate::models::{ByteRange, ReachabilityGroup, RequestDescriptor, SourceDescriptor};
use crate::profiles::{PreferenceMode, SourceProfile};
use crate::registry::SourceRegistry;

const FAST_LOCAL_BOOST: f64 = 3.0;
const RANGE_FACTOR: f64 = 1.2;
const NO_RANGE_FACTOR: f64 = 0.85;
const MIN_WEIGHT: f64 = 0.1;
const DEFAULT_DESIRED_BYTES: u64 = 8 * MIB;

/// What the prober currently knows about the fast-local group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReachabilityView {
    pub available: bool,
    pub source_ids: Vec<String>,
}

/// Holds the allowed source pool and picks sources from it.
#[derive(Debug)]
pub struct SourceSelector {
    allowed: RwLock<Vec<String>>,
    /// Bumped every time the pool is re-derived.
    generation: AtomicU64,
    fallback_id: String,
}

impl SourceSelector {
    pub fn new(fallback_id: impl Into<String>) -> Self {
        let fallback_id = fallback_id.into();
        Self {
            allowed: RwLock::new(vec![fallback_id.clone()]),
            generation: AtomicU64::new(0),
            fallback_id,
        }
    }

    pub fn fallback_id(&self) -> &str {
        &self.fallback_id
    }

    /// Recompute the allowed pool from the active profile and reachability.
    pub fn rederive(
        &self,
        profile: &SourceProfile,
        reachability: &ReachabilityView,
        registry: &SourceRegistry,
    ) -> Vec<String> {
        let pool = derive_allowed_pool(profile, reachability, registry, &self.fallback_id);
        *self.allowed.write() = pool.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        pool
    }

    pub fn allowed(&self) -> Vec<String> {
        self.allowed.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Pick a source from the allowed pool, or the fallback if none of it is registered.
    pub fn pick<R: Rng + ?Sized>(
        &self,
        registry: &SourceRegistry,
        chunk_mb: u64,
        rng: &mut R,
    ) -> Option<SourceDescriptor> {
        let pool = registry.resolve(&self.allowed.read());
        let desired = desired_bytes(chunk_mb);
        pick_source(&pool, desired, rng).or_else(|| registry.lookup(&self.fallback_id))
    }

    pub fn build_request<R: Rng + ?Sized>(
        &self,
        registry: &SourceRegistry,
        chunk_mb: u64,
        rng: &mut R,
    ) -> Option<RequestDescriptor> {
        let source = self.pick(registry, chunk_mb, rng)?;
        Some(build_request(source, chunk_mb, rng))
    }
}

fn desired_bytes(chunk_mb: u64) -> u64 {
    match chunk_mb {
        0 => DEFAULT_DESIRED_BYTES,
        mb => mb * MIB,
    }
}

/// Build the ordered, de-duplicated list of source ids a profile allows.
///
/// The fallback id is always present, so the result is never empty as long as
/// the fallback is registered.
pub fn derive_allowed_pool(
    profile: &SourceProfile,
    reachability: &ReachabilityView,
    registry: &SourceRegistry,
    fallback_id: &str,
) -> Vec<String> {
    let fast_local = &reachability.source_ids;
    let mut ids: Vec<String> = profile.ids.clone();

    if reachability.available && !fast_local.is_empty() {
        match profile.preference {
            PreferenceMode::Exclusive => {
                ids = fast_local.iter().chain(&profile.fallback_ids).cloned().collect();
            }
            PreferenceMode::Prepend => {
                ids = fast_local.iter().chain(&profile.ids).cloned().collect();
            }
            PreferenceMode::Append => ids.extend(fast_local.iter().cloned()),
            PreferenceMode::Ignore => {}
        }
    } else if profile.preference == PreferenceMode::Exclusive {
        ids = profile.fallback_ids.iter().chain(&profile.ids).cloned().collect();
    }

    ids.extend(profile.fallback_ids.iter().cloned());
    ids.push(fallback_id.to_string());

    let mut seen = HashSet::new();
    let pool: Vec<String> = ids
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .filter(|id| registry.contains(id))
        .collect();

    if pool.is_empty() {
        vec![fallback_id.to_string()]
    } else {
        pool
    }
}

/// Selection weight of a source for a desired chunk size.
pub fn source_weight(source: &SourceDescriptor, desired_bytes: u64) -> f64 {
    let performance = source.performance.unwrap_or(1.0);
    let boost = match source.group {
        ReachabilityGroup::FastLocal => FAST_LOCAL_BOOST,
        ReachabilityGroup::Public => 1.0,
    };
    let range_factor = if source.supports_range { RANGE_FACTOR } else { NO_RANGE_FACTOR };

    let size = source.size_bytes.unwrap_or(desired_bytes);
    let ratio = if size > 0 && desired_bytes > 0 {
        size.min(desired_bytes) as f64 / size.max(desired_bytes) as f64
    } else {
        1.0
    };
    let fit = if source.supports_range { 0.9 + ratio } else { 0.6 + ratio };

    (source.weight * boost * range_factor * fit * (1.0 + performance / 10.0)).max(MIN_WEIGHT)
}

/// Weighted-random choice. Returns `None` only for an empty pool.
pub fn pick_source<R: Rng + ?Sized>(
    pool: &[SourceDescriptor],
    desired_bytes: u64,
    rng: &mut R,
) -> Option<SourceDescriptor> {
    if pool.is_empty() {
        return None;
    }

    let weights: Vec<f64> = pool.iter().map(|s| source_weight(s, desired_bytes)).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return pool.get(rng.gen_range(0..pool.len())).cloned();
    }

    let mut roll = rng.gen::<f64>() * total;
    for (source, weight) in pool.iter().zip(&weights) {
        roll -= weight;
        if roll <= 0.0 {
            return Some(source.clone());
        }
    }
    pool.last().cloned()
}

/// Turn a picked source into a concrete request with a random byte window.
pub fn build_request<R: Rng + ?Sized>(
    source: SourceDescriptor,
    chunk_mb: u64,
    rng: &mut R,
) -> RequestDescriptor {
    let wanted = desired_bytes(chunk_mb);
    let chunk_bytes = source.size_bytes.map_or(wanted, |size| wanted.min(size));

    let range = match source.size_bytes {
        Some(size) if source.supports_range && size > 0 && chunk_bytes > 0 => {
            let max_start = size.saturating_sub(chunk_bytes).saturating_sub(1);
            let start = rng.gen_range(0..=max_start);
            let end = (start + chunk_bytes - 1).min(size - 1);
            Some(ByteRange { start, end })
        }
        _ => None,
    };

    let separator = if source.url.contains('?') { '&' } else { '?' };
    let url = format!("{}{}cb={}", source.url, separator, cache_bust_token(rng));

    RequestDescriptor {
        source,
        url,
        range,
        chunk_bytes,
    }
}

/// `<base36 unix millis>-<base36 random>`.
pub fn cache_bust_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{}-{}", to_base36(millis), to_base36(rng.gen()))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
