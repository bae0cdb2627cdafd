//! # Data Model
//! Shared types for the aggregation pipeline: observed codes, provenance,
//! per-source reports, and the final `AggregationResult` returned to callers.
//!
//! Timestamps are unix seconds throughout.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One provider's observation of a code. Immutable once created; merging
/// appends new entries, never rewrites old ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub source: String,
    /// Trust weight of the provider at observation time, clamped to [0, 1].
    pub weight: f32,
    /// Provider is trusted enough to verify a code on its own.
    pub authoritative: bool,
    pub fetched_at: u64,
    /// Origin URL or post id, when the provider exposes one.
    pub origin: Option<String>,
}

/// A candidate or confirmed redemption code.
///
/// `code` is the normalized dedup key (uppercase, trimmed, internal dashes
/// preserved). `sources` is never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Code {
    pub code: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub sources: Vec<Provenance>,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Computed by the dedup engine, never supplied by a provider.
    #[serde(default)]
    pub verified: bool,
}

impl Code {
    /// Build a single-observation candidate the way adapters emit them.
    pub fn observed(code: String, prov: Provenance) -> Self {
        let ts = prov.fetched_at;
        let mut tags = BTreeSet::new();
        tags.insert(prov.source.clone());
        Self {
            code,
            title: None,
            description: None,
            sources: vec![prov],
            first_seen_at: ts,
            last_seen_at: ts,
            tags,
            expires_at: None,
            verified: false,
        }
    }
}

/// Per-source outcome reported alongside the merged code list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    /// Fetch failed but cached data stood in, or the source looks unhealthy.
    Degraded,
    Failed,
    NotConfigured,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub status: SourceStatus,
    pub items: usize,
    #[serde(default)]
    pub last_fetch_at: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn not_configured() -> Self {
        Self {
            status: SourceStatus::NotConfigured,
            items: 0,
            last_fetch_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationStats {
    /// Raw observations before merging.
    pub total: usize,
    pub unique: usize,
    pub duplicates: usize,
    /// Groups that actually merged more than one observation.
    pub merged: usize,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub stale: bool,
}

/// The only object returned to callers. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    pub generated_at: u64,
    pub codes: Vec<Code>,
    pub sources: BTreeMap<String, SourceReport>,
    pub stats: AggregationStats,
}

impl AggregationResult {
    /// Last-resort result: zero codes, honest per-source statuses.
    pub fn empty(sources: BTreeMap<String, SourceReport>) -> Self {
        Self {
            generated_at: now_unix(),
            codes: Vec::new(),
            sources,
            stats: AggregationStats::default(),
        }
    }
}

const DAY_SECS: u64 = 24 * 3600;

/// Read-time filter applied to the aggregate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Active,
    Past7,
    All,
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Scope::Active),
            "past7" => Ok(Scope::Past7),
            "all" | "" => Ok(Scope::All),
            other => Err(anyhow::anyhow!("unknown scope '{other}'")),
        }
    }
}

/// Keep codes matching the scope, relative to `now`.
///
/// `active`: a future expiry always keeps the code and a past one always
/// drops it; with no expiry at all, fall back to the "active" tag or a
/// last-seen within 30 days.
pub fn filter_scope(codes: &[Code], scope: Scope, now: u64) -> Vec<Code> {
    match scope {
        Scope::All => codes.to_vec(),
        Scope::Past7 => codes
            .iter()
            .filter(|c| now.saturating_sub(c.last_seen_at) <= 7 * DAY_SECS)
            .cloned()
            .collect(),
        Scope::Active => codes
            .iter()
            .filter(|c| match c.expires_at {
                Some(exp) => exp > now,
                None => {
                    c.tags.contains("active")
                        || now.saturating_sub(c.last_seen_at) <= 30 * DAY_SECS
                }
            })
            .cloned()
            .collect(),
    }
}

/// Case-insensitive substring search over code string, description, and tags.
pub fn filter_search(codes: &[Code], needle: &str) -> Vec<Code> {
    let q = needle.trim().to_ascii_lowercase();
    if q.is_empty() {
        return codes.to_vec();
    }
    codes
        .iter()
        .filter(|c| {
            c.code.to_ascii_lowercase().contains(&q)
                || c.description
                    .as_deref()
                    .is_some_and(|d| d.to_ascii_lowercase().contains(&q))
                || c.tags.iter().any(|t| t.to_ascii_lowercase().contains(&q))
        })
        .cloned()
        .collect()
}

/// Current UNIX time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_at(code: &str, last_seen: u64, expires: Option<u64>) -> Code {
        let prov = Provenance {
            source: "forum".into(),
            weight: 0.6,
            authoritative: false,
            fetched_at: last_seen,
            origin: None,
        };
        let mut c = Code::observed(code.to_string(), prov);
        c.expires_at = expires;
        c
    }

    #[test]
    fn expired_yesterday_is_not_active_but_is_in_all() {
        let now = 100 * DAY_SECS;
        let c = code_at("ABC123", now, Some(now - DAY_SECS));
        let active = filter_scope(std::slice::from_ref(&c), Scope::Active, now);
        assert!(active.is_empty());
        let all = filter_scope(std::slice::from_ref(&c), Scope::All, now);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn no_expiry_falls_back_to_recency_or_tag() {
        let now = 100 * DAY_SECS;
        let recent = code_at("AA11BB", now - DAY_SECS, None);
        let mut stale = code_at("CC22DD", now - 45 * DAY_SECS, None);
        let active = filter_scope(&[recent.clone(), stale.clone()], Scope::Active, now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "AA11BB");

        // Tagged "active" survives even when old.
        stale.tags.insert("active".into());
        let active = filter_scope(&[stale], Scope::Active, now);
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn past7_keeps_only_last_week() {
        let now = 100 * DAY_SECS;
        let fresh = code_at("XY12ZW", now - 3 * DAY_SECS, None);
        let old = code_at("QQ99RR", now - 10 * DAY_SECS, None);
        let out = filter_scope(&[fresh, old], Scope::Past7, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, "XY12ZW");
    }

    #[test]
    fn search_matches_code_description_and_tags() {
        let mut a = code_at("GIFT4U", 10, None);
        a.description = Some("Anniversary gems".into());
        let b = code_at("PLAY99", 10, None);

        let by_code = filter_search(&[a.clone(), b.clone()], "gift");
        assert_eq!(by_code.len(), 1);
        let by_desc = filter_search(&[a.clone(), b.clone()], "GEMS");
        assert_eq!(by_desc.len(), 1);
        let by_tag = filter_search(&[a, b], "forum");
        assert_eq!(by_tag.len(), 2);
    }
}
