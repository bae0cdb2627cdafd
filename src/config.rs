//! # Configuration
//! Explicit config structs with documented defaults. Loaded from TOML
//! (`AGGREGATOR_CONFIG_PATH` env, fallback `config/aggregator.toml`);
//! every field is `#[serde(default)]` so partial files override the
//! defaults field-by-field.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "AGGREGATOR_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/aggregator.toml";

/// Which adapter implementation a source entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// JSON announcements feed (chat export API).
    Chat,
    /// RSS/Atom forum feed.
    Forum,
    /// JSON social timeline.
    Social,
    /// Scraped HTML page.
    Web,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Endpoint to fetch; a source without one is reported `not_configured`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    500
}

/// Tunable verification policy (kept out of code on purpose; the reference
/// values were never validated against real provider trust distributions).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrustPolicy {
    #[serde(default = "default_verify_threshold")]
    pub verify_threshold: f32,
    #[serde(default = "default_verify_window_secs")]
    pub verify_window_secs: u64,
}

fn default_verify_threshold() -> f32 {
    1.5
}
fn default_verify_window_secs() -> u64 {
    24 * 3600
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            verify_threshold: default_verify_threshold(),
            verify_window_secs: default_verify_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker short-circuits before a half-open trial.
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: u64,
    /// Oldest cached fallback payload still acceptable to serve.
    #[serde(default = "default_stale_ceiling_secs")]
    pub stale_ceiling_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_secs() -> u64 {
    300
}
fn default_stale_ceiling_secs() -> u64 {
    24 * 3600
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_secs: default_recovery_secs(),
            stale_ceiling_secs: default_stale_ceiling_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RefreshConfig {
    /// Cached aggregate younger than this is returned as-is.
    #[serde(default = "default_force_refresh_secs")]
    pub force_refresh_secs: u64,
    /// Serve stale + revalidate in the background instead of blocking.
    #[serde(default = "default_true")]
    pub background: bool,
    /// Timer-based re-run interval, independent of read traffic.
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,
    /// TTL on the cached aggregate envelope.
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
}

fn default_force_refresh_secs() -> u64 {
    30 * 60
}
fn default_refresh_interval_secs() -> u64 {
    300
}
fn default_result_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            force_refresh_secs: default_force_refresh_secs(),
            background: true,
            interval_secs: default_refresh_interval_secs(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Redis-compatible REST endpoint shared across instances. When unset or
    /// unreachable at startup, the in-process store is used instead.
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub rest_token: Option<String>,
}

/// How duplicate observations of one code are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Full attribute merge with trust accumulation.
    #[default]
    Merge,
    Newest,
    Oldest,
    HighestPriority,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Client identifier sent to providers (User-Agent).
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub trust_policy: TrustPolicy,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub merge_mode: MergeMode,
    /// Provider priority order, consulted by `highest_priority` merging.
    #[serde(default)]
    pub priority: Vec<String>,
    /// Trust weights JSON; seed defaults apply when missing.
    #[serde(default = "default_trust_path")]
    pub trust_path: String,
    /// Directory for dated result snapshots; disabled when unset.
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

fn default_client_id() -> String {
    "promo-code-aggregator/0.1".to_string()
}

fn default_trust_path() -> String {
    "config/trust_weights.json".to_string()
}

fn default_sources() -> Vec<SourceSettings> {
    [
        ("official-discord", SourceKind::Chat),
        ("fan-forum", SourceKind::Forum),
        ("twitter", SourceKind::Social),
        ("community-wiki", SourceKind::Web),
    ]
    .into_iter()
    .map(|(name, kind)| SourceSettings {
        name: name.to_string(),
        kind,
        enabled: true,
        url: None,
        timeout_secs: default_timeout_secs(),
        retries: default_retries(),
        backoff_ms: default_backoff_ms(),
    })
    .collect()
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            sources: default_sources(),
            trust_policy: TrustPolicy::default(),
            breaker: BreakerConfig::default(),
            refresh: RefreshConfig::default(),
            cache: CacheConfig::default(),
            merge_mode: MergeMode::default(),
            priority: Vec::new(),
            trust_path: default_trust_path(),
            snapshot_dir: None,
        }
    }
}

impl AggregatorConfig {
    /// Parse from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load using env var + fallback:
    /// 1) $AGGREGATOR_CONFIG_PATH (must exist when set)
    /// 2) config/aggregator.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            anyhow::bail!("{ENV_PATH} points to non-existent path");
        }
        let fallback = PathBuf::from(DEFAULT_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        Ok(Self::default())
    }

    pub fn source(&self, name: &str) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.name == name)
    }
}
