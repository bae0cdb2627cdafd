//! # Circuit Breaker / Fallback Manager
//! Tracks failure streaks per source, short-circuits repeat offenders, and
//! substitutes cached data while a source is down.
//!
//! State machine per key: closed → open after `failure_threshold`
//! consecutive failures → half-open once the recovery window elapses (one
//! trial request allowed) → closed on success, back to open (window reset)
//! on failure. Breaker state lives in process memory; only fallback payloads
//! travel through the cache store.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{get_json, set_json, CacheStore, Envelope};
use crate::config::BreakerConfig;
use crate::model::now_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
struct Breaker {
    failures: u32,
    last_failure_at: u64,
    tripped: bool,
    /// A half-open trial request is currently in flight.
    probing: bool,
}

/// Diagnostic view exposed by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerView {
    pub state: BreakerState,
    pub failures: u32,
    pub last_failure_at: u64,
}

/// How `execute_with_fallback` satisfied the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackOutcome<T> {
    /// The operation ran and succeeded.
    Fresh(T),
    /// Served from the fallback cache; may be past its nominal TTL.
    Stale { value: T, age_secs: u64 },
    /// Caller-supplied default, nothing cached was usable.
    Default(T),
}

impl<T> FallbackOutcome<T> {
    pub fn into_value(self) -> T {
        match self {
            FallbackOutcome::Fresh(v)
            | FallbackOutcome::Stale { value: v, .. }
            | FallbackOutcome::Default(v) => v,
        }
    }
}

pub struct FallbackManager {
    cache: Arc<dyn CacheStore>,
    cfg: BreakerConfig,
    states: Mutex<HashMap<String, Breaker>>,
}

fn fallback_key(key: &str) -> String {
    format!("fallback:{key}")
}

impl FallbackManager {
    pub fn new(cache: Arc<dyn CacheStore>, cfg: BreakerConfig) -> Self {
        Self {
            cache,
            cfg,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Effective state right now; an expired open window reads as half-open.
    pub fn state_of(&self, key: &str) -> BreakerState {
        let states = self.states.lock().expect("breaker mutex poisoned");
        match states.get(key) {
            None => BreakerState::Closed,
            Some(b) if !b.tripped => BreakerState::Closed,
            Some(b) => {
                if now_unix().saturating_sub(b.last_failure_at) >= self.cfg.recovery_secs {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Any success fully resets the breaker.
    fn record_success(&self, key: &str) {
        let mut states = self.states.lock().expect("breaker mutex poisoned");
        states.remove(key);
    }

    /// A failure during half-open re-trips and restarts the window.
    fn record_failure(&self, key: &str) {
        let mut states = self.states.lock().expect("breaker mutex poisoned");
        let b = states.entry(key.to_string()).or_default();
        b.failures += 1;
        b.last_failure_at = now_unix();
        b.probing = false;
        if !b.tripped && b.failures >= self.cfg.failure_threshold {
            b.tripped = true;
            counter!("breaker_opened_total", "key" => key.to_string()).increment(1);
            tracing::warn!(key, failures = b.failures, "circuit breaker opened");
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerView> {
        let states = self.states.lock().expect("breaker mutex poisoned");
        states
            .iter()
            .map(|(k, b)| {
                let state = if !b.tripped {
                    BreakerState::Closed
                } else if now_unix().saturating_sub(b.last_failure_at) >= self.cfg.recovery_secs {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                };
                (
                    k.clone(),
                    BreakerView {
                        state,
                        failures: b.failures,
                        last_failure_at: b.last_failure_at,
                    },
                )
            })
            .collect()
    }

    /// Run `op` under the breaker for `key`. An open breaker skips `op`
    /// entirely. Successes are cached as fallback material; failures fall
    /// back to the most recent cached value (up to the staleness ceiling),
    /// then to `default`, and only then propagate the error.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        key: &str,
        op: F,
        default: Option<T>,
    ) -> Result<FallbackOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        if !self.try_acquire(key) {
            let err = anyhow::anyhow!("breaker open for '{key}', call skipped");
            return self.serve_fallback(key, default, err).await;
        }
        match op().await {
            Ok(value) => {
                self.record_success(key);
                set_json(
                    self.cache.as_ref(),
                    &fallback_key(key),
                    &Envelope::new(&value),
                    self.cfg.stale_ceiling_secs,
                )
                .await;
                Ok(FallbackOutcome::Fresh(value))
            }
            Err(e) => {
                self.record_failure(key);
                self.serve_fallback(key, default, e).await
            }
        }
    }

    /// Admission check done under the state mutex. A closed breaker always
    /// admits; a tripped one admits exactly one trial request once the
    /// recovery window has elapsed, claiming the slot so concurrent callers
    /// stay short-circuited until the trial settles.
    fn try_acquire(&self, key: &str) -> bool {
        let mut states = self.states.lock().expect("breaker mutex poisoned");
        match states.get_mut(key) {
            None => true,
            Some(b) if !b.tripped => true,
            Some(b) => {
                if b.probing {
                    return false;
                }
                if now_unix().saturating_sub(b.last_failure_at) >= self.cfg.recovery_secs {
                    b.probing = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn serve_fallback<T>(
        &self,
        key: &str,
        default: Option<T>,
        err: anyhow::Error,
    ) -> Result<FallbackOutcome<T>>
    where
        T: DeserializeOwned + Send,
    {
        let cached: Option<Envelope<T>> = get_json(self.cache.as_ref(), &fallback_key(key)).await;
        if let Some(env) = cached {
            let age_secs = env.age_secs(now_unix());
            if age_secs <= self.cfg.stale_ceiling_secs {
                counter!("fallback_served_total", "key" => key.to_string()).increment(1);
                tracing::info!(key, age_secs, "serving cached fallback");
                return Ok(FallbackOutcome::Stale {
                    value: env.payload,
                    age_secs,
                });
            }
            tracing::warn!(key, age_secs, "cached fallback past staleness ceiling");
        }
        if let Some(v) = default {
            return Ok(FallbackOutcome::Default(v));
        }
        Err(err)
    }

    /// True when cached data for this key is still young enough to stand in
    /// for a failed fetch (the orchestrator reports such sources `degraded`
    /// rather than `failed`).
    pub async fn has_acceptable_fallback(&self, key: &str) -> bool {
        let cached: Option<Envelope<serde_json::Value>> =
            get_json(self.cache.as_ref(), &fallback_key(key)).await;
        cached.is_some_and(|env| env.age_secs(now_unix()) <= self.cfg.stale_ceiling_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(cfg: BreakerConfig) -> FallbackManager {
        FallbackManager::new(Arc::new(MemoryStore::new()), cfg)
    }

    fn failing_op(calls: &AtomicUsize) -> impl Future<Output = Result<u32>> + Send + '_ {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(anyhow::anyhow!("provider down")) }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_skips_calls() {
        let mgr = manager(BreakerConfig {
            failure_threshold: 3,
            recovery_secs: 300,
            stale_ceiling_secs: 3600,
        });
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let r = mgr
                .execute_with_fallback::<u32, _, _>("s", || failing_op(&calls), None)
                .await;
            assert!(r.is_err(), "no fallback material yet");
        }
        assert_eq!(mgr.state_of("s"), BreakerState::Open);

        // Open breaker: operation is not even attempted.
        let r = mgr
            .execute_with_fallback::<u32, _, _>("s", || failing_op(&calls), None)
            .await;
        assert!(r.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn half_open_allows_a_trial_and_success_closes() {
        let mgr = manager(BreakerConfig {
            failure_threshold: 1,
            recovery_secs: 1,
            stale_ceiling_secs: 3600,
        });
        let calls = AtomicUsize::new(0);

        let _ = mgr
            .execute_with_fallback::<u32, _, _>("s", || failing_op(&calls), None)
            .await;
        assert_eq!(mgr.state_of("s"), BreakerState::Open);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(mgr.state_of("s"), BreakerState::HalfOpen);

        let r = mgr
            .execute_with_fallback("s", || async { Ok::<_, anyhow::Error>(7u32) }, None)
            .await
            .unwrap();
        assert_eq!(r, FallbackOutcome::Fresh(7));
        assert_eq!(mgr.state_of("s"), BreakerState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_trial() {
        let mgr = manager(BreakerConfig {
            failure_threshold: 1,
            recovery_secs: 1,
            stale_ceiling_secs: 3600,
        });
        let calls = AtomicUsize::new(0);

        let _ = mgr
            .execute_with_fallback::<u32, _, _>("s", || failing_op(&calls), None)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(mgr.state_of("s"), BreakerState::HalfOpen);

        // The trial holds the slot while in flight; a concurrent caller is
        // short-circuited instead of becoming a second trial.
        let trial = mgr.execute_with_fallback(
            "s",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(9u32)
            },
            None,
        );
        let rival = mgr.execute_with_fallback::<u32, _, _>(
            "s",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(9u32)
            },
            None,
        );
        let (a, b) = tokio::join!(trial, rival);

        assert_eq!(a.unwrap(), FallbackOutcome::Fresh(9));
        assert!(b.is_err(), "rival must not reach the provider");
        assert_eq!(calls.load(Ordering::SeqCst), 2, "initial failure + one trial");
        assert_eq!(mgr.state_of("s"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failure_serves_cached_value_as_stale() {
        let mgr = manager(BreakerConfig::default());

        let r = mgr
            .execute_with_fallback("s", || async { Ok::<_, anyhow::Error>(41u32) }, None)
            .await
            .unwrap();
        assert_eq!(r, FallbackOutcome::Fresh(41));
        assert!(mgr.has_acceptable_fallback("s").await);

        let r = mgr
            .execute_with_fallback::<u32, _, _>(
                "s",
                || async { Err(anyhow::anyhow!("boom")) },
                None,
            )
            .await
            .unwrap();
        match r {
            FallbackOutcome::Stale { value, .. } => assert_eq!(value, 41),
            other => panic!("expected stale fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_used_when_nothing_cached() {
        let mgr = manager(BreakerConfig::default());
        let r = mgr
            .execute_with_fallback(
                "empty",
                || async { Err(anyhow::anyhow!("boom")) },
                Some(0u32),
            )
            .await
            .unwrap();
        assert_eq!(r, FallbackOutcome::Default(0));
    }
}
