// src/registry.rs

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::SourceDescriptor;

#[derive(Debug, Default)]
struct Catalog {
    sources: HashMap<String, SourceDescriptor>,
    /// Registration order, so `all()` is stable.
    order: Vec<String>,
}

/// In-memory catalog of every endpoint the engine knows about.
///
/// Sources are never removed; reachability is decided by the selector.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    catalog: RwLock<Catalog>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the public catalog from [`builtin_sources`].
    pub fn with_builtin_catalog(fallback_id: &str) -> Self {
        let registry = Self::new();
        for source in builtin_sources(fallback_id) {
            registry.register(source);
        }
        registry
    }

    /// Insert or update a source by id. An update keeps the observed performance score.
    pub fn register(&self, mut descriptor: SourceDescriptor) {
        let mut catalog = self.catalog.write();
        match catalog.sources.get(&descriptor.id) {
            Some(existing) => {
                if descriptor.performance.is_none() {
                    descriptor.performance = existing.performance;
                }
            }
            None => catalog.order.push(descriptor.id.clone()),
        }
        catalog.sources.insert(descriptor.id.clone(), descriptor);
    }

    pub fn lookup(&self, id: &str) -> Option<SourceDescriptor> {
        self.catalog.read().sources.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.catalog.read().sources.contains_key(id)
    }

    pub fn all(&self) -> Vec<SourceDescriptor> {
        let catalog = self.catalog.read();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.sources.get(id).cloned())
            .collect()
    }

    /// Resolve ids to descriptors, silently skipping unknown ones.
    pub fn resolve(&self, ids: &[String]) -> Vec<SourceDescriptor> {
        let catalog = self.catalog.read();
        ids.iter()
            .filter_map(|id| catalog.sources.get(id).cloned())
            .collect()
    }

    pub fn set_performance(&self, id: &str, score: f64) {
        if let Some(source) = self.catalog.write().sources.get_mut(id) {
            source.performance = Some(score);
        }
    }

    pub fn clear_performance(&self) {
        for source in self.catalog.write().sources.values_mut() {
            source.performance = None;
        }
    }

    pub fn len(&self) -> usize {
        self.catalog.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const GTV_BUCKET: &str = "https://commondatastorage.googleapis.com/gtv-videos-bucket/sample";

/// Large public video files with range support plus one small script used as
/// the universal fallback.
pub fn builtin_sources(fallback_id: &str) -> Vec<SourceDescriptor> {
    let video = |id: &str, label: &str, file: &str, size: u64, weight: f64| {
        SourceDescriptor::new(id, label, &format!("{GTV_BUCKET}/{file}"))
            .with_size(size)
            .with_range(true)
            .with_weight(weight)
    };

    vec![
        video("bbb", "Big Buck Bunny (158 MB)", "BigBuckBunny.mp4", 158_008_374, 3.0),
        video("sintel", "Sintel (215 MB)", "Sintel.mp4", 215_330_292, 3.0),
        video("steel", "Tears of Steel (177 MB)", "TearsOfSteel.mp4", 185_765_954, 2.0),
        video("elephant", "Elephants Dream (162 MB)", "ElephantsDream.mp4", 169_612_362, 2.0),
        video("subaru", "Subaru Outback (46 MB)", "SubaruOutbackOnStreetAndDirt.mp4", 48_051_822, 2.0),
        video("gti", "VW GTI Review (41 MB)", "VolkswagenGTIReview.mp4", 43_780_763, 1.0),
        video("bullrun", "Bullrun Teaser (12 MB)", "WeAreGoingOnBullrun.mp4", 13_183_260, 1.0),
        SourceDescriptor::new(
            fallback_id,
            "JSDelivr fallback",
            "https://cdn.jsdelivr.net/npm/jquery@3.6.4/dist/jquery.min.js",
        )
        .with_size(88_145)
        .as_fallback(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_an_upsert() {
        let registry = SourceRegistry::new();
        registry.register(SourceDescriptor::new("a", "A", "http://a"));
        registry.set_performance("a", 4.0);
        registry.register(SourceDescriptor::new("a", "A2", "http://a2").with_weight(5.0));

        assert_eq!(registry.len(), 1);
        let a = registry.lookup("a").unwrap();
        assert_eq!(a.label, "A2");
        assert_eq!(a.weight, 5.0);
        assert_eq!(a.performance, Some(4.0));
    }

    #[test]
    fn all_keeps_registration_order() {
        let registry = SourceRegistry::with_builtin_catalog("jsdelivr");
        let ids: Vec<_> = registry.all().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.first().map(String::as_str), Some("bbb"));
        assert_eq!(ids.last().map(String::as_str), Some("jsdelivr"));
        assert!(registry.lookup("jsdelivr").unwrap().fallback);
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn resolve_skips_unknown_ids() {
        let registry = SourceRegistry::with_builtin_catalog("jsdelivr");
        let resolved = registry.resolve(&["gti".into(), "missing".into(), "bbb".into()]);
        let ids: Vec<_> = resolved.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["gti", "bbb"]);
    }
}
