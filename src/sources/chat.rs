//! Community chat announcements adapter (JSON export API).
//!
//! Payload is either a bare array of messages or `{"messages": [...]}`,
//! depending on the export endpoint version; both are accepted.

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
struct ChatMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: String,
    /// Unix seconds; missing for some relayed messages.
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    pinned: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatPayload {
    Bare(Vec<ChatMessage>),
    Wrapped { messages: Vec<ChatMessage> },
}

impl ChatPayload {
    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            ChatPayload::Bare(v) => v,
            ChatPayload::Wrapped { messages } => messages,
        }
    }
}

pub struct ChatFeedAdapter {
    desc: Descriptor,
    mode: FetchMode,
    health: HealthCache,
}

impl ChatFeedAdapter {
    pub fn new(desc: Descriptor, mode: FetchMode) -> Self {
        Self {
            desc,
            mode,
            health: HealthCache::new(),
        }
    }

    fn parse(&self, body: &str) -> Result<Vec<Code>> {
        let payload: ChatPayload = serde_json::from_str(body)
            .with_context(|| format!("{} chat payload", self.desc.name))?;
        let now = now_unix();
        let mut out = Vec::new();
        for msg in payload.into_messages() {
            let seen_at = msg.timestamp.filter(|t| *t > 0).unwrap_or(now);
            for token in extract_codes(&msg.content) {
                let prov = self.desc.provenance(msg.id.clone(), now);
                let mut code = Code::observed(token, prov);
                code.first_seen_at = seen_at;
                code.last_seen_at = seen_at;
                code.tags.insert("chat".into());
                if msg.pinned {
                    code.tags.insert("pinned".into());
                }
                out.push(code);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for ChatFeedAdapter {
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
    use crate::trust::TrustConfig;

    fn adapter(fixture: &str) -> ChatFeedAdapter {
        let trust = TrustConfig::default_seed();
        let settings = crate::config::SourceSettings {
            name: "official-discord".into(),
            kind: crate::config::SourceKind::Chat,
            enabled: true,
            url: None,
            timeout_secs: 2,
            retries: 0,
            backoff_ms: 10,
        };
        let desc = Descriptor::from_settings(&settings, &trust, "test-agent");
        ChatFeedAdapter::new(desc, FetchMode::fixture(fixture))
    }

    #[tokio::test]
    async fn extracts_codes_from_both_payload_shapes() {
        let bare = r#"[
            {"id":"m1","content":"New code GEMS2024 just dropped!","timestamp":1700000000},
            {"id":"m2","content":"no codes here","timestamp":1700000100}
        ]"#;
        let got = adapter(bare).fetch().await.unwrap();
        assert_eq!(got.count, 1);
        assert_eq!(got.codes[0].code, "GEMS2024");
        assert_eq!(got.codes[0].last_seen_at, 1_700_000_000);
        assert_eq!(got.codes[0].sources[0].origin.as_deref(), Some("m1"));
        assert!(got.codes[0].sources[0].authoritative);

        let wrapped = r#"{"messages":[{"id":"m3","content":"pinned: VIP-77-X","pinned":true}]}"#;
        let got = adapter(wrapped).fetch().await.unwrap();
        assert_eq!(got.count, 1);
        assert!(got.codes[0].tags.contains("pinned"));
        assert!(got.codes[0].tags.contains("chat"));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_typed_failure() {
        let err = adapter("{oops").fetch().await.unwrap_err();
        assert!(format!("{err:#}").contains("chat payload"));
    }
}
