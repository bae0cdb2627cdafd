//! # Provider Trust Table
//!
//! Configurable mapping from provider names (e.g. "official-news",
//! "fan-forum") to trust weights in `[0.0, 1.0]`, plus the set of providers
//! considered inherently authoritative (a single observation from one of
//! those verifies a code on its own).
//!
//! - Loads from JSON config (weights + aliases + authoritative set).
//! - Case-insensitive lookup with normalization of punctuation and dashes.
//! - Aliases map alternative spellings/handles to canonical providers.
//! - Fallback order: aliases → exact match → substring match → default.
//! - Ships a built-in `default_seed()` with common community providers.

use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

/// Trust configuration, loaded from JSON or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    /// Default weight if no match is found.
    #[serde(default = "default_default_weight")]
    pub default_weight: f32,
    /// Explicit weights for canonical provider names.
    #[serde(default)]
    pub weights: HashMap<String, f32>,
    /// Aliases mapping non-canonical names → canonical names.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Canonical names whose observations verify a code outright.
    #[serde(default)]
    pub authoritative: HashSet<String>,
}

fn default_default_weight() -> f32 {
    0.50
}

impl TrustConfig {
    /// Load configuration from a JSON file.
    /// Falls back to `default_seed()` on error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|_| Self::default_seed()),
            Err(_) => Self::default_seed(),
        }
    }

    /// Get the weight for a provider name.
    ///
    /// Steps:
    /// 1. Alias lookup (normalized) → canonical → weight.
    /// 2. Exact weight match.
    /// 3. Substring fallback (e.g. "Official News EN" → "official news").
    /// 4. Default weight.
    pub fn weight_for(&self, provider: &str) -> f32 {
        let s = normalize(provider);

        if let Some(canon) = self.aliases.get(&s) {
            let c = normalize(canon);
            if let Some(&w) = self.weights.get(&c) {
                return clamp01(w);
            }
        }

        if let Some(&w) = self.weights.get(&s) {
            return clamp01(w);
        }

        for (k, &w) in &self.weights {
            if s.contains(k) {
                return clamp01(w);
            }
        }

        clamp01(self.default_weight)
    }

    /// True when the provider (after alias resolution) is in the
    /// authoritative set.
    pub fn is_authoritative(&self, provider: &str) -> bool {
        let s = normalize(provider);
        let canon = self.aliases.get(&s).map(|c| normalize(c)).unwrap_or(s);
        self.authoritative.contains(&canon)
    }

    /// Built-in seed with common community providers for a live game.
    /// Used as fallback if no config is found.
    pub(crate) fn default_seed() -> Self {
        let mut weights = HashMap::new();
        let mut aliases = HashMap::new();
        let mut authoritative = HashSet::new();

        for (k, v) in [
            ("official news", 1.0),
            ("official discord", 0.95),
            ("patch notes", 0.95),
            ("community wiki", 0.85),
            ("reddit", 0.70),
            ("fan forum", 0.60),
            ("twitter", 0.55),
            ("stream chat", 0.40),
            ("pastebin", 0.30),
        ] {
            weights.insert(k.to_string(), v);
        }

        for (a, c) in [
            ("announcements", "official discord"),
            ("discord announcements", "official discord"),
            ("dev blog", "official news"),
            ("news", "official news"),
            ("wiki", "community wiki"),
            ("fandom", "community wiki"),
            ("r gamecodes", "reddit"),
            ("subreddit", "reddit"),
            ("forum", "fan forum"),
            ("x", "twitter"),
            ("@gamecodes", "twitter"),
        ] {
            aliases.insert(a.to_string(), c.to_string());
        }

        authoritative.insert("official news".to_string());
        authoritative.insert("official discord".to_string());

        Self {
            default_weight: 0.50,
            weights,
            aliases,
            authoritative,
        }
    }
}

/// Normalize input string: lowercase, replace punctuation/dashes with spaces,
/// collapse multiple spaces into one.
fn normalize(s: &str) -> String {
    let mut out = s.trim().to_ascii_lowercase();

    for ch in ['—', '–', '-', '_', '/', '\\'] {
        out = out.replace(ch, " ");
    }

    out = out.replace(['\n', '\r', '\t', '.', ',', '’', '\''], " ");

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clamp to [0.0, 1.0].
fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
