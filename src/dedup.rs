//! # Deduplication & Trust Engine
//! Merges duplicate observations of the same code into one record and
//! computes the verified flag from accumulated trust.
//!
//! Input is a flat candidate list, one entry per observation (each carrying a
//! single provenance entry). Candidates are grouped by normalized code and
//! reconciled per the configured merge mode; `verified` comes from either an
//! inherently authoritative source or a trust-weight sum within the policy
//! window.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{AggregatorConfig, MergeMode, TrustPolicy};
use crate::extract::normalize_code;
use crate::model::Code;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DedupStats {
    pub total: usize,
    pub unique: usize,
    pub duplicates: usize,
    /// Groups that actually folded more than one observation.
    pub merged: usize,
}

#[derive(Debug)]
pub struct DedupOutcome {
    pub codes: Vec<Code>,
    pub stats: DedupStats,
}

pub struct DedupEngine {
    mode: MergeMode,
    priority: Vec<String>,
    policy: TrustPolicy,
}

impl DedupEngine {
    pub fn new(mode: MergeMode, priority: Vec<String>, policy: TrustPolicy) -> Self {
        Self {
            mode,
            priority,
            policy,
        }
    }

    pub fn from_config(cfg: &AggregatorConfig) -> Self {
        Self::new(cfg.merge_mode, cfg.priority.clone(), cfg.trust_policy)
    }

    /// Merge candidates into one record per normalized key, stable-sorted by
    /// recency descending.
    pub fn run(&self, candidates: Vec<Code>, now: u64) -> DedupOutcome {
        let total = candidates.len();

        // Group by normalized key, preserving first-appearance order.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Code>> = HashMap::new();
        for mut cand in candidates {
            cand.code = normalize_code(&cand.code);
            let key = cand.code.clone();
            groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            groups.get_mut(&cand.code).expect("group just inserted").push(cand);
        }

        let unique = order.len();
        let mut merged_groups = 0usize;
        let mut out = Vec::with_capacity(unique);
        for key in order {
            let group = groups.remove(&key).expect("group listed in order");
            if group.len() > 1 {
                merged_groups += 1;
            }
            let mut rec = self.reconcile(group);
            rec.verified = self.is_verified(&rec, now);
            out.push(rec);
        }

        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));

        DedupOutcome {
            codes: out,
            stats: DedupStats {
                total,
                unique,
                duplicates: total - unique,
                merged: merged_groups,
            },
        }
    }

    /// Collapse one group into its output record per the configured mode.
    fn reconcile(&self, group: Vec<Code>) -> Code {
        debug_assert!(!group.is_empty());
        match self.mode {
            MergeMode::Merge => merge_all(group),
            MergeMode::Newest => pick(group, |a, b| a.last_seen_at >= b.last_seen_at),
            MergeMode::Oldest => pick(group, |a, b| a.last_seen_at < b.last_seen_at),
            MergeMode::HighestPriority => {
                let rank = |c: &Code| {
                    c.sources
                        .first()
                        .and_then(|p| self.priority.iter().position(|n| *n == p.source))
                        .unwrap_or(usize::MAX)
                };
                pick(group, |a, b| rank(a) < rank(b))
            }
        }
    }

    /// Authoritative source wins outright; otherwise sum the weights of
    /// observations inside the policy window.
    fn is_verified(&self, code: &Code, now: u64) -> bool {
        if code.sources.iter().any(|p| p.authoritative) {
            return true;
        }
        let window = self.policy.verify_window_secs;
        let sum: f32 = code
            .sources
            .iter()
            .filter(|p| now.saturating_sub(p.fetched_at) <= window)
            .map(|p| p.weight)
            .sum();
        sum >= self.policy.verify_threshold
    }
}

/// First candidate that beats every later one under `better` wins; ties keep
/// the earlier observation.
fn pick(group: Vec<Code>, better: impl Fn(&Code, &Code) -> bool) -> Code {
    let mut it = group.into_iter();
    let mut best = it.next().expect("non-empty group");
    for cand in it {
        if !better(&best, &cand) {
            best = cand;
        }
    }
    best
}

/// Full attribute merge: concatenated provenance, unioned tags, widest seen
/// span, earliest non-null expiry, first non-null title/description.
fn merge_all(group: Vec<Code>) -> Code {
    let mut it = group.into_iter();
    let mut acc = it.next().expect("non-empty group");
    for cand in it {
        acc.sources.extend(cand.sources);
        acc.tags.extend(cand.tags);
        acc.first_seen_at = acc.first_seen_at.min(cand.first_seen_at);
        acc.last_seen_at = acc.last_seen_at.max(cand.last_seen_at);
        acc.expires_at = match (acc.expires_at, cand.expires_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if acc.title.is_none() {
            acc.title = cand.title;
        }
        if acc.description.is_none() {
            acc.description = cand.description;
        }
    }
    acc
}

/// Post-hoc consistency check used by tests, not by production control flow.
pub fn validate(outcome: &DedupOutcome, input_len: usize) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    for c in &outcome.codes {
        if c.code != normalize_code(&c.code) {
            anyhow::bail!("output key '{}' is not normalized", c.code);
        }
        if !seen.insert(c.code.clone()) {
            anyhow::bail!("duplicate key '{}' in output", c.code);
        }
        if c.sources.is_empty() {
            anyhow::bail!("record '{}' has no provenance", c.code);
        }
    }
    let s = outcome.stats;
    if s.total != input_len || s.total != s.unique + s.duplicates || s.unique != outcome.codes.len()
    {
        anyhow::bail!(
            "stats do not reconcile: total={} unique={} duplicates={} out={}",
            s.total,
            s.unique,
            s.duplicates,
            outcome.codes.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provenance;

    const NOW: u64 = 1_000_000;

    fn cand(code: &str, source: &str, weight: f32, at: u64) -> Code {
        Code::observed(
            code.to_string(),
            Provenance {
                source: source.to_string(),
                weight,
                authoritative: false,
                fetched_at: at,
                origin: None,
            },
        )
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(MergeMode::Merge, Vec::new(), TrustPolicy::default())
    }

    #[test]
    fn three_recent_sources_cross_threshold() {
        let cands = vec![
            cand("WIN123", "a", 0.5, NOW - 10),
            cand("win123", "b", 0.6, NOW - 20),
            cand("WIN123", "c", 0.7, NOW - 30),
        ];
        let out = engine().run(cands, NOW);
        validate(&out, 3).unwrap();
        assert_eq!(out.codes.len(), 1);
        assert!(out.codes[0].verified, "0.5+0.6+0.7 = 1.8 >= 1.5");
        assert_eq!(out.codes[0].sources.len(), 3);
        assert_eq!(out.stats.merged, 1);
    }

    #[test]
    fn lone_low_weight_observation_stays_unverified() {
        let out = engine().run(vec![cand("SOLO42", "a", 0.5, NOW)], NOW);
        assert!(!out.codes[0].verified);
    }

    #[test]
    fn observations_outside_window_do_not_count() {
        let old = TrustPolicy::default().verify_window_secs + 100;
        let cands = vec![
            cand("OLD999", "a", 0.9, NOW - old),
            cand("OLD999", "b", 0.9, NOW - old),
        ];
        let out = engine().run(cands, NOW);
        assert!(!out.codes[0].verified);
    }

    #[test]
    fn single_authoritative_source_verifies_regardless_of_weight() {
        let mut c = cand("OFFI1A", "official-news", 0.2, NOW);
        c.sources[0].authoritative = true;
        let out = engine().run(vec![c], NOW);
        assert!(out.codes[0].verified);
    }

    #[test]
    fn reference_scenario_two_records() {
        let cands = vec![
            cand("ABC123", "a", 0.5, NOW - 100),
            cand("abc123", "b", 0.7, NOW - 50),
            cand("XYZ789", "a", 0.9, NOW - 10),
        ];
        let out = engine().run(cands, NOW);
        validate(&out, 3).unwrap();
        assert_eq!(out.codes.len(), 2);
        // Sorted by recency descending.
        assert_eq!(out.codes[0].code, "XYZ789");
        assert_eq!(out.codes[1].code, "ABC123");
        let abc = &out.codes[1];
        assert_eq!(abc.sources.len(), 2);
        assert!(!abc.verified, "1.2 < 1.5 and nobody authoritative");
        assert!(!out.codes[0].verified);
        assert_eq!(out.stats.total, 3);
        assert_eq!(out.stats.unique, 2);
        assert_eq!(out.stats.duplicates, 1);
    }

    #[test]
    fn merge_keeps_earliest_expiry_and_first_title() {
        let mut a = cand("GEM5X", "a", 0.5, NOW - 100);
        a.expires_at = Some(NOW + 500);
        a.title = None;
        let mut b = cand("GEM5X", "b", 0.5, NOW - 50);
        b.expires_at = Some(NOW + 100);
        b.title = Some("100 gems".into());
        let out = engine().run(vec![a, b], NOW);
        let rec = &out.codes[0];
        assert_eq!(rec.expires_at, Some(NOW + 100));
        assert_eq!(rec.title.as_deref(), Some("100 gems"));
        assert_eq!(rec.first_seen_at, NOW - 100);
        assert_eq!(rec.last_seen_at, NOW - 50);
        assert!(rec.tags.contains("a") && rec.tags.contains("b"));
    }

    #[test]
    fn newest_and_oldest_pick_a_representative() {
        let cands = || {
            vec![
                cand("PICK1A", "a", 0.5, NOW - 100),
                cand("PICK1A", "b", 0.5, NOW - 10),
            ]
        };
        let newest = DedupEngine::new(MergeMode::Newest, Vec::new(), TrustPolicy::default());
        let out = newest.run(cands(), NOW);
        assert_eq!(out.codes[0].sources[0].source, "b");

        let oldest = DedupEngine::new(MergeMode::Oldest, Vec::new(), TrustPolicy::default());
        let out = oldest.run(cands(), NOW);
        assert_eq!(out.codes[0].sources[0].source, "a");
    }

    #[test]
    fn highest_priority_follows_configured_order() {
        let eng = DedupEngine::new(
            MergeMode::HighestPriority,
            vec!["wiki".into(), "forum".into()],
            TrustPolicy::default(),
        );
        let cands = vec![
            cand("PRIO9Z", "forum", 0.5, NOW - 10),
            cand("PRIO9Z", "wiki", 0.5, NOW - 100),
            cand("PRIO9Z", "unlisted", 0.5, NOW - 5),
        ];
        let out = eng.run(cands, NOW);
        assert_eq!(out.codes[0].sources[0].source, "wiki");
    }
}
