//! Fan-forum RSS adapter.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::extract::extract_codes;
use crate::model::{now_unix, Code};
use crate::sources::{
    fetch_payload, finish_fetch, probe_health, Descriptor, FetchMode, FetchSuccess, HealthCache,
    HealthReport, SourceAdapter,
};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> u64 {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|x| u64::try_from(x).ok())
        .unwrap_or(0)
}

pub struct ForumRssAdapter {
    desc: Descriptor,
    mode: FetchMode,
    health: HealthCache,
}

impl ForumRssAdapter {
    pub fn new(desc: Descriptor, mode: FetchMode) -> Self {
        Self {
            desc,
            mode,
            health: HealthCache::new(),
        }
    }

    fn parse(&self, body: &str) -> Result<Vec<Code>> {
        let xml_clean = scrub_html_entities_for_xml(body);
        let rss: Rss =
            from_str(&xml_clean).with_context(|| format!("{} rss xml", self.desc.name))?;

        let now = now_unix();
        let mut out = Vec::new();
        for it in rss.channel.item {
            let text = format!(
                "{} {}",
                it.title.as_deref().unwrap_or_default(),
                it.description.as_deref().unwrap_or_default()
            );
            let published = it
                .pub_date
                .as_deref()
                .map(parse_rfc2822_to_unix)
                .filter(|t| *t > 0)
                .unwrap_or(now);
            for token in extract_codes(&text) {
                let prov = self.desc.provenance(it.link.clone(), now);
                let mut code = Code::observed(token, prov);
                code.first_seen_at = published;
                code.last_seen_at = published;
                code.title = it.title.clone();
                code.tags.insert("forum".into());
                out.push(code);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for ForumRssAdapter {
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

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, SourceSettings};
    use crate::trust::TrustConfig;

    const FIXTURE: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Fan Forum — Codes</title>
    <item>
      <title>Weekend megathread: LOOT-55 confirmed working</title>
      <link>https://forum.example/t/9911</link>
      <pubDate>Fri, 22 Aug 2025 10:00:00 GMT</pubDate>
      <description>Also try SPIN8X&nbsp;before it dies.</description>
    </item>
    <item>
      <title>Off-topic: patch discussion</title>
      <link>https://forum.example/t/9912</link>
      <pubDate>Fri, 22 Aug 2025 11:00:00 GMT</pubDate>
      <description>nothing redeemable here</description>
    </item>
  </channel>
</rss>"#;

    fn adapter(fixture: &str) -> ForumRssAdapter {
        let settings = SourceSettings {
            name: "fan-forum".into(),
            kind: SourceKind::Forum,
            enabled: true,
            url: None,
            timeout_secs: 2,
            retries: 0,
            backoff_ms: 10,
        };
        let desc = Descriptor::from_settings(&settings, &TrustConfig::default_seed(), "test-agent");
        ForumRssAdapter::new(desc, FetchMode::fixture(fixture))
    }

    #[tokio::test]
    async fn parses_items_and_stamps_pubdate() {
        let got = adapter(FIXTURE).fetch().await.unwrap();
        let codes: Vec<&str> = got.codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["LOOT-55", "SPIN8X"]);
        let loot = &got.codes[0];
        assert_eq!(loot.sources[0].origin.as_deref(), Some("https://forum.example/t/9911"));
        assert!(!loot.sources[0].authoritative);
        assert!((loot.sources[0].weight - 0.60).abs() < 1e-6);
        // Fri, 22 Aug 2025 10:00:00 GMT
        assert_eq!(loot.last_seen_at, 1_755_856_800);
    }

    #[tokio::test]
    async fn broken_xml_is_a_typed_failure() {
        let err = adapter("<rss><channel>").fetch().await.unwrap_err();
        assert!(format!("{err:#}").contains("rss xml"));
    }
}
