//! Dated JSON snapshots of the aggregate result for offline inspection.
//! Side-channel write; live serving never depends on it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::cache::{get_json, CacheStore, Envelope};
use crate::model::AggregationResult;
use crate::refresh::AGGREGATE_KEY;

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Store one named snapshot (best-effort).
    async fn store(&self, name: String, content: String) -> Result<()>;
}

/// One file per run under a configured directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SnapshotSink for FileSink {
    async fn store(&self, name: String, content: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Serialize one result into a dated file name.
pub async fn snapshot_once<S: SnapshotSink + ?Sized>(
    sink: &S,
    result: &AggregationResult,
) -> Result<()> {
    let name = format!(
        "codes-{}.json",
        chrono::Utc::now().format("%Y-%m-%d-%H%M%S")
    );
    let content = serde_json::to_string_pretty(result).context("serializing snapshot")?;
    sink.store(name, content).await
}

/// Periodically snapshot whatever aggregate is currently cached.
pub fn spawn_snapshot_task<S: SnapshotSink + 'static>(
    cache: Arc<dyn CacheStore>,
    sink: S,
    every_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(every_secs.max(1)));
        loop {
            ticker.tick().await;
            let cached: Option<Envelope<AggregationResult>> =
                get_json(cache.as_ref(), AGGREGATE_KEY).await;
            if let Some(env) = cached {
                if let Err(e) = snapshot_once(&sink, &env.payload).await {
                    tracing::warn!(error = %format!("{e:#}"), "snapshot write failed");
                }
            }
        }
    })
}

// --- Test helper ---
pub struct MockSink {
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(vec![]),
        }
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSink for MockSink {
    async fn store(&self, name: String, content: String) -> Result<()> {
        self.calls.lock().unwrap().push((name, content));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AggregationResult;

    #[tokio::test]
    async fn snapshot_writes_dated_json() {
        let sink = MockSink::new();
        let result = AggregationResult::empty(Default::default());
        snapshot_once(&sink, &result).await.unwrap();

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (name, content) = &calls[0];
        assert!(name.starts_with("codes-") && name.ends_with(".json"));
        let parsed: AggregationResult = serde_json::from_str(content).unwrap();
        assert!(parsed.codes.is_empty());
    }

    #[tokio::test]
    async fn file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("snapshots"));
        sink.store("codes-test.json".into(), "{}".into())
            .await
            .unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("snapshots").join("codes-test.json")).unwrap();
        assert_eq!(content, "{}");
    }
}
