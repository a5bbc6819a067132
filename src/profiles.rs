// src/profiles.rs

use serde::{Deserialize, Serialize};

/// Tuning bounds selected by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggressionPreset {
    pub id: String,
    pub label: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub min_chunk_mb: u64,
    pub max_chunk_mb: u64,
}

/// How a profile blends in the fast-local sources while they are reachable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceMode {
    /// Only fast-local sources (plus the profile's fallback list).
    Exclusive,
    Prepend,
    Append,
    Ignore,
}

/// A named source mix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceProfile {
    pub id: String,
    pub label: String,
    pub description: String,
    pub ids: Vec<String>,
    #[serde(default)]
    pub fallback_ids: Vec<String>,
    pub preference: PreferenceMode,
}

/// Static table of presets and profiles.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    presets: Vec<AggressionPreset>,
    profiles: Vec<SourceProfile>,
}

impl ProfileStore {
    pub fn new(presets: Vec<AggressionPreset>, profiles: Vec<SourceProfile>) -> Self {
        Self { presets, profiles }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_presets(), builtin_profiles())
    }

    pub fn preset(&self, id: &str) -> Option<&AggressionPreset> {
        self.presets.iter().find(|preset| preset.id == id)
    }

    pub fn profile(&self, id: &str) -> Option<&SourceProfile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn presets(&self) -> &[AggressionPreset] {
        &self.presets
    }

    pub fn profiles(&self) -> &[SourceProfile] {
        &self.profiles
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_presets() -> Vec<AggressionPreset> {
    let preset = |id: &str, label: &str, workers: (usize, usize), chunk_mb: (u64, u64)| {
        AggressionPreset {
            id: id.to_string(),
            label: label.to_string(),
            min_workers: workers.0,
            max_workers: workers.1,
            min_chunk_mb: chunk_mb.0,
            max_chunk_mb: chunk_mb.1,
        }
    };

    vec![
        preset("eco", "Calm drain", (4, 14), (8, 64)),
        preset("balanced", "Balanced burn", (10, 26), (16, 128)),
        preset("ludicrous", "Ludicrous flood", (18, 40), (32, 256)),
    ]
}

fn builtin_profiles() -> Vec<SourceProfile> {
    let ids = |list: &[&str]| list.iter().map(|id| id.to_string()).collect::<Vec<_>>();

    vec![
        SourceProfile {
            id: "auto".into(),
            label: "Auto mix (prefers Tailnet when ready)".into(),
            description: "Rotates big public files, but switches to the Pi when reachable.".into(),
            ids: ids(&["bbb", "sintel", "steel", "elephant", "subaru", "gti", "bullrun"]),
            fallback_ids: Vec::new(),
            preference: PreferenceMode::Prepend,
        },
        SourceProfile {
            id: "heavy".into(),
            label: "Heaviest only".into(),
            description: "Sticks to the largest clips and adds Tailnet bursts when available.".into(),
            ids: ids(&["sintel", "steel", "elephant", "bbb"]),
            fallback_ids: Vec::new(),
            preference: PreferenceMode::Prepend,
        },
        SourceProfile {
            id: "tailnet".into(),
            label: "Tailnet priority".into(),
            description: "Uses the Pi whenever it is reachable; remote files only if it drops.".into(),
            ids: Vec::new(),
            fallback_ids: ids(&["bbb", "sintel"]),
            preference: PreferenceMode::Exclusive,
        },
        SourceProfile {
            id: "fallback".into(),
            label: "Remote CDN fallback".into(),
            description: "Ignores Tailnet and stays on public mirrors only.".into(),
            ids: ids(&["bbb", "sintel", "steel", "elephant", "subaru", "gti", "bullrun", "jsdelivr"]),
            fallback_ids: Vec::new(),
            preference: PreferenceMode::Ignore,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_presets_are_well_formed() {
        let store = ProfileStore::builtin();
        for preset in store.presets() {
            assert!(preset.min_workers <= preset.max_workers, "{}", preset.id);
            assert!(preset.min_chunk_mb <= preset.max_chunk_mb, "{}", preset.id);
        }
        assert_eq!(store.preset("balanced").unwrap().max_workers, 26);
        assert!(store.preset("warp").is_none());
    }

    #[test]
    fn tailnet_profile_is_exclusive_with_fallbacks() {
        let store = ProfileStore::builtin();
        let tailnet = store.profile("tailnet").unwrap();
        assert_eq!(tailnet.preference, PreferenceMode::Exclusive);
        assert!(tailnet.ids.is_empty());
        assert_eq!(tailnet.fallback_ids, ["bbb", "sintel"]);
    }

    #[test]
    fn preference_mode_uses_lowercase_names() {
        let mode: PreferenceMode = serde_json::from_str("\"prepend\"").unwrap();
        assert_eq!(mode, PreferenceMode::Prepend);
    }
}
