//! Social timeline adapter (JSON API, `{"data": [...]}` envelope).
//!
//! This provider is the one that rate-limits aggressively; the shared retry
//! helper backs off on 429 using its Retry-After hint (capped at 60 s).

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::extract::extract_codes;
use crate::model::{now_unix, Code};
use crate::sources::{
    fetch_payload, finish_fetch, probe_health, Descriptor, FetchMode, FetchSuccess, HealthCache,
    HealthReport, SourceAdapter,
};

#[derive(Debug, Deserialize)]
struct Timeline {
    #[serde(default)]
    data: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: String,
    /// RFC 3339, e.g. "2025-08-22T10:00:00Z".
    #[serde(default)]
    created_at: Option<String>,
}

fn parse_rfc3339_to_unix(ts: &str) -> u64 {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.timestamp())
        .and_then(|x| u64::try_from(x).ok())
        .unwrap_or(0)
}

pub struct SocialFeedAdapter {
    desc: Descriptor,
    mode: FetchMode,
    health: HealthCache,
}

impl SocialFeedAdapter {
    pub fn new(desc: Descriptor, mode: FetchMode) -> Self {
        Self {
            desc,
            mode,
            health: HealthCache::new(),
        }
    }

    fn parse(&self, body: &str) -> Result<Vec<Code>> {
        let timeline: Timeline = serde_json::from_str(body)
            .with_context(|| format!("{} timeline payload", self.desc.name))?;
        let now = now_unix();
        let mut out = Vec::new();
        for post in timeline.data {
            let published = post
                .created_at
                .as_deref()
                .map(parse_rfc3339_to_unix)
                .filter(|t| *t > 0)
                .unwrap_or(now);
            for token in extract_codes(&post.text) {
                let prov = self.desc.provenance(post.id.clone(), now);
                let mut code = Code::observed(token, prov);
                code.first_seen_at = published;
                code.last_seen_at = published;
                code.tags.insert("social".into());
                out.push(code);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for SocialFeedAdapter {
    fn name(&self) -> &str {
        &self.desc.name
    }

    async fn fetch(&self) -> Result<FetchSuccess> {
        let t0 = Instant::now();
        let body = fetch_payload(&self.mode, &self.desc).await?;
        let codes = self.parse(&body)?;
        Ok(finish_fetch(&self.desc, codes, t0))
    }

    async fn health_check(&self) -> HealthReport {
        probe_health(&self.health, &self.mode, &self.desc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, SourceSettings};
    use crate::trust::TrustConfig;

    fn adapter(fixture: &str) -> SocialFeedAdapter {
        let settings = SourceSettings {
            name: "twitter".into(),
            kind: SourceKind::Social,
            enabled: true,
            url: None,
            timeout_secs: 2,
            retries: 0,
            backoff_ms: 10,
        };
        let desc = Descriptor::from_settings(&settings, &TrustConfig::default_seed(), "test-agent");
        SocialFeedAdapter::new(desc, FetchMode::fixture(fixture))
    }

    #[tokio::test]
    async fn extracts_codes_with_post_timestamps() {
        let fixture = r#"{"data":[
            {"id":"t1","text":"RT if you grabbed FREE100X already","created_at":"2025-08-22T10:00:00Z"},
            {"id":"t2","text":"gm"}
        ]}"#;
        let got = adapter(fixture).fetch().await.unwrap();
        assert_eq!(got.count, 1);
        assert_eq!(got.codes[0].code, "FREE100X");
        assert_eq!(got.codes[0].last_seen_at, 1_755_856_800);
        assert!((got.codes[0].sources[0].weight - 0.55).abs() < 1e-6);
        assert!(got.codes[0].tags.contains("social"));
    }

    #[tokio::test]
    async fn empty_timeline_is_ok_not_an_error() {
        let got = adapter(r#"{"data":[]}"#).fetch().await.unwrap();
        assert_eq!(got.count, 0);
    }
}
