//! # Cache Store
//! Key/value store with per-entry TTL, used both as the response cache and
//! as the fallback reservoir for degraded sources.
//!
//! Two interchangeable implementations share the contract: `RestKvStore`
//! talks to a Redis-compatible REST endpoint (shared across instances) and
//! `MemoryStore` keeps an in-process map (lazy expiry on read plus a 60 s
//! sweeper). Selection happens once at startup based on reachability;
//! callers never learn which one is active.
//!
//! Every operation is soft-fail: a cache outage degrades to "no caching",
//! it never fails a request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::model::now_unix;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl_secs: u64);
    async fn exists(&self, key: &str) -> bool;
    /// Remaining TTL in seconds; `None` when the key is missing.
    async fn ttl(&self, key: &str) -> Option<i64>;
    /// Glob-style pattern where `*` matches any run of characters.
    async fn keys(&self, pattern: &str) -> Vec<String>;
    async fn delete(&self, key: &str);
    async fn flush_all(&self);
    /// Atomic counter used for breaker failure counts and rate limiting.
    /// The TTL is applied when the counter is first created.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> i64;
    fn backend(&self) -> &'static str;
}

/// Typed get: JSON-decode the stored payload, `None` on miss or decode error.
pub async fn get_json<T: DeserializeOwned>(store: &dyn CacheStore, key: &str) -> Option<T> {
    let raw = store.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, error = %e, "cache payload failed to decode, dropping");
            store.delete(key).await;
            None
        }
    }
}

/// Typed set: JSON-encode and store. Encode errors are logged and swallowed.
pub async fn set_json<T: Serialize>(store: &dyn CacheStore, key: &str, value: &T, ttl_secs: u64) {
    match serde_json::to_string(value) {
        Ok(raw) => store.set(key, &raw, ttl_secs).await,
        Err(e) => tracing::warn!(key, error = %e, "cache payload failed to encode"),
    }
}

/// Wrapper recording when a payload was cached, so fallback reads can judge
/// staleness after the nominal TTL has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub cached_at: u64,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            cached_at: now_unix(),
            payload,
        }
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.cached_at)
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    written_at: u64,
    ttl_secs: u64,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.ttl_secs > 0 && now >= self.written_at + self.ttl_secs
    }

    fn remaining(&self, now: u64) -> i64 {
        if self.ttl_secs == 0 {
            return -1;
        }
        (self.written_at + self.ttl_secs) as i64 - now as i64
    }
}

/// Single-instance map store. Used when no remote store is reachable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop every expired entry. Called by the sweeper; reads also expire
    /// lazily so correctness does not depend on the sweep cadence.
    pub fn sweep(&self) -> usize {
        let now = now_unix();
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        let before = map.len();
        map.retain(|_, e| !e.expired(now));
        before - map.len()
    }
}

/// Periodic eviction of expired entries (every 60 s in production).
pub fn spawn_sweeper(store: Arc<MemoryStore>, every_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
        loop {
            ticker.tick().await;
            let evicted = store.sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "cache sweep");
            }
        }
    })
}

fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let now = now_unix();
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        match map.get(key) {
            Some(e) if e.expired(now) => {
                map.remove(key);
                None
            }
            Some(e) => Some(e.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) {
        let entry = Entry {
            value: value.to_string(),
            written_at: now_unix(),
            ttl_secs,
        };
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.insert(key.to_string(), entry);
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn ttl(&self, key: &str) -> Option<i64> {
        let now = now_unix();
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        match map.get(key) {
            Some(e) if e.expired(now) => {
                map.remove(key);
                None
            }
            Some(e) => Some(e.remaining(now)),
            None => None,
        }
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let now = now_unix();
        let map = self.inner.lock().expect("cache mutex poisoned");
        map.iter()
            .filter(|(k, e)| !e.expired(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    async fn delete(&self, key: &str) {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.remove(key);
    }

    async fn flush_all(&self) {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.clear();
    }

    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> i64 {
        let now = now_unix();
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        let fresh = match map.get(key) {
            Some(e) if !e.expired(now) => e.value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let written_at = if fresh == 1 {
            now
        } else {
            map.get(key).map(|e| e.written_at).unwrap_or(now)
        };
        map.insert(
            key.to_string(),
            Entry {
                value: fresh.to_string(),
                written_at,
                ttl_secs,
            },
        );
        fresh
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Remote REST implementation (Redis-compatible HTTP dialect)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RestReply {
    result: serde_json::Value,
}

/// Shared store reachable by every process instance. Speaks the
/// `GET {base}/get/{key}`-style REST dialect with a Bearer token.
pub struct RestKvStore {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RestKvStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.client.request(method, format!("{}/{}", self.base, path));
        if let Some(t) = &self.token {
            rb = rb.bearer_auth(t);
        }
        rb
    }

    async fn command(&self, method: reqwest::Method, path: &str) -> Option<serde_json::Value> {
        self.command_with_body(method, path, None).await
    }

    async fn command_with_body(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Option<serde_json::Value> {
        let mut rb = self.request(method, path);
        if let Some(b) = body {
            rb = rb.body(b);
        }
        match rb.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<RestReply>().await {
                Ok(r) => Some(r.result),
                Err(e) => {
                    tracing::warn!(path, error = %e, "cache rest reply not parseable");
                    None
                }
            },
            Ok(resp) => {
                tracing::warn!(path, status = %resp.status(), "cache rest command rejected");
                None
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "cache rest command failed");
                None
            }
        }
    }

    /// Startup reachability probe.
    pub async fn ping(&self) -> bool {
        matches!(
            self.command(reqwest::Method::GET, "ping").await,
            Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("pong")
        )
    }
}

#[async_trait]
impl CacheStore for RestKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.command(reqwest::Method::GET, &format!("get/{key}")).await? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) {
        let path = if ttl_secs > 0 {
            format!("set/{key}?EX={ttl_secs}")
        } else {
            format!("set/{key}")
        };
        let _ = self
            .command_with_body(reqwest::Method::POST, &path, Some(value.to_string()))
            .await;
    }

    async fn exists(&self, key: &str) -> bool {
        matches!(
            self.command(reqwest::Method::GET, &format!("exists/{key}")).await,
            Some(v) if v.as_i64() == Some(1)
        )
    }

    async fn ttl(&self, key: &str) -> Option<i64> {
        let v = self.command(reqwest::Method::GET, &format!("ttl/{key}")).await?;
        match v.as_i64() {
            // -2 is the dialect's "no such key".
            Some(-2) | None => None,
            Some(n) => Some(n),
        }
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        match self.command(reqwest::Method::GET, &format!("keys/{pattern}")).await {
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn delete(&self, key: &str) {
        let _ = self.command(reqwest::Method::GET, &format!("del/{key}")).await;
    }

    async fn flush_all(&self) {
        let _ = self.command(reqwest::Method::POST, "flushall").await;
    }

    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> i64 {
        let v = self
            .command(reqwest::Method::GET, &format!("incr/{key}"))
            .await
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if v == 1 && ttl_secs > 0 {
            let _ = self
                .command(reqwest::Method::GET, &format!("expire/{key}/{ttl_secs}"))
                .await;
        }
        v
    }

    fn backend(&self) -> &'static str {
        "rest"
    }
}

/// Pick the store once at startup: remote when configured and reachable,
/// in-process otherwise. Callers only ever see `Arc<dyn CacheStore>`.
pub async fn select_store(cfg: &CacheConfig) -> (Arc<dyn CacheStore>, Option<Arc<MemoryStore>>) {
    if let Some(url) = &cfg.rest_url {
        let store = RestKvStore::new(url, cfg.rest_token.clone());
        if store.ping().await {
            tracing::info!(url, "using remote cache store");
            return (Arc::new(store), None);
        }
        tracing::warn!(url, "remote cache store unreachable, falling back to memory");
    }
    let mem = MemoryStore::shared();
    (mem.clone(), Some(mem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_ttl_and_lazy_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", 1).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.exists("k").await);
        assert!(store.ttl("k").await.unwrap_or(0) <= 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
        assert_eq!(store.ttl("k").await, None);
    }

    #[tokio::test]
    async fn zero_ttl_means_no_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", 0).await;
        assert_eq!(store.ttl("k").await, Some(-1));
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn incr_counts_up_and_expires() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_with_ttl("n", 1).await, 1);
        assert_eq!(store.incr_with_ttl("n", 1).await, 2);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        // Counter restarts after its TTL window.
        assert_eq!(store.incr_with_ttl("n", 1).await, 1);
    }

    #[tokio::test]
    async fn keys_glob_and_delete() {
        let store = MemoryStore::new();
        store.set("source:forum", "1", 0).await;
        store.set("source:chat", "1", 0).await;
        store.set("aggregate:last", "1", 0).await;

        let mut ks = store.keys("source:*").await;
        ks.sort();
        assert_eq!(ks, vec!["source:chat".to_string(), "source:forum".to_string()]);

        store.delete("source:chat").await;
        assert!(!store.exists("source:chat").await);

        store.flush_all().await;
        assert!(store.keys("*").await.is_empty());
    }

    #[tokio::test]
    async fn json_codec_round_trip_and_poison_recovery() {
        let store = MemoryStore::new();
        set_json(&store, "env", &Envelope::new(vec![1u32, 2, 3]), 0).await;
        let env: Envelope<Vec<u32>> = get_json(&store, "env").await.unwrap();
        assert_eq!(env.payload, vec![1, 2, 3]);

        store.set("env", "{not json", 0).await;
        let missing: Option<Envelope<Vec<u32>>> = get_json(&store, "env").await;
        assert!(missing.is_none());
        // Poisoned entry was dropped on read.
        assert!(!store.exists("env").await);
    }

    #[test]
    fn glob_match_variants() {
        assert!(glob_match("source:*", "source:forum"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("source:*", "aggregate:last"));
        assert!(!glob_match("exact", "exact-not"));
        assert!(glob_match("exact", "exact"));
    }
}
