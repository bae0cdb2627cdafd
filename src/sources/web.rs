//! Scraped-page adapter (community wiki).
//!
//! The wiki keeps a table of working codes followed by an "Expired" section;
//! only the part above that heading is harvested. Lines may carry an
//! `YYYY-MM-DD` expiry date next to the code.

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::extract::extract_codes;
use crate::model::{now_unix, Code};
use crate::sources::{
    fetch_payload, finish_fetch, probe_health, Descriptor, FetchMode, FetchSuccess, HealthCache,
    HealthReport, SourceAdapter,
};

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap())
}

fn re_breaks() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(?:br\s*/?|/p|/li|/tr|/h[1-6])>").unwrap())
}

fn re_date() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap())
}

/// HTML → plain text lines: entity decode, block-level tags become line
/// breaks, remaining tags stripped.
fn html_to_lines(html: &str) -> Vec<String> {
    let decoded = html_escape::decode_html_entities(html).to_string();
    let broken = re_breaks().replace_all(&decoded, "\n");
    let stripped = re_tags().replace_all(&broken, " ");
    stripped
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect()
}

fn is_expired_heading(line: &str) -> bool {
    let l = line.trim().to_ascii_lowercase();
    l.starts_with("expired")
}

/// End-of-day unix timestamp for a `YYYY-MM-DD` date found on the line.
fn expiry_on_line(line: &str) -> Option<u64> {
    let m = re_date().find(line)?;
    let date = chrono::NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok()?;
    let ts = date.and_hms_opt(23, 59, 59)?.and_utc().timestamp();
    u64::try_from(ts).ok()
}

pub struct WebPageAdapter {
    desc: Descriptor,
    mode: FetchMode,
    health: HealthCache,
}

impl WebPageAdapter {
    pub fn new(desc: Descriptor, mode: FetchMode) -> Self {
        Self {
            desc,
            mode,
            health: HealthCache::new(),
        }
    }

    fn parse(&self, body: &str) -> Vec<Code> {
        let now = now_unix();
        let mut out = Vec::new();
        for line in html_to_lines(body) {
            if is_expired_heading(&line) {
                break;
            }
            let expires_at = expiry_on_line(&line);
            for token in extract_codes(&line) {
                let prov = self.desc.provenance(None, now);
                let mut code = Code::observed(token, prov);
                code.expires_at = expires_at;
                code.tags.insert("wiki".into());
                out.push(code);
            }
        }
        out
    }
}

#[async_trait]
impl SourceAdapter for WebPageAdapter {
    fn name(&self) -> &str {
        &self.desc.name
    }

    async fn fetch(&self) -> Result<FetchSuccess> {
        let t0 = Instant::now();
        let body = fetch_payload(&self.mode, &self.desc).await?;
        let codes = self.parse(&body);
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

    const FIXTURE: &str = r#"<html><body>
<h2>Working codes</h2>
<table>
<tr><td>WELCOME25X</td><td>100 gems</td><td>2031-12-31</td></tr>
<tr><td>RAID7-GO</td><td>raid pass</td></tr>
</table>
<h2>Expired codes</h2>
<ul>
<li>DEAD404Z &ndash; removed 2024-01-01</li>
</ul>
</body></html>"#;

    fn adapter(fixture: &str) -> WebPageAdapter {
        let settings = SourceSettings {
            name: "community-wiki".into(),
            kind: SourceKind::Web,
            enabled: true,
            url: None,
            timeout_secs: 2,
            retries: 0,
            backoff_ms: 10,
        };
        let desc = Descriptor::from_settings(&settings, &TrustConfig::default_seed(), "test-agent");
        WebPageAdapter::new(desc, FetchMode::fixture(fixture))
    }

    #[tokio::test]
    async fn harvests_only_above_the_expired_section() {
        let got = adapter(FIXTURE).fetch().await.unwrap();
        let codes: Vec<&str> = got.codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["WELCOME25X", "RAID7-GO"]);
        assert!(got.codes.iter().all(|c| c.tags.contains("wiki")));
    }

    #[tokio::test]
    async fn expiry_date_on_the_line_is_attached() {
        let got = adapter(FIXTURE).fetch().await.unwrap();
        let welcome = &got.codes[0];
        // 2031-12-31 end of day.
        assert_eq!(welcome.expires_at, Some(1_956_527_999));
        assert_eq!(got.codes[1].expires_at, None);
    }

    #[test]
    fn heading_detection_is_case_insensitive() {
        assert!(is_expired_heading("EXPIRED CODES"));
        assert!(is_expired_heading("expired"));
        assert!(!is_expired_heading("codes that expired recently")); // prose line
    }
}
