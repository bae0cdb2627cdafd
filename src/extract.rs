//! # Code Extraction
//! Pulls candidate redemption-code tokens out of free text (chat messages,
//! RSS descriptions, scraped pages) and normalizes them into dedup keys.
//!
//! A valid token is alphanumeric with optional internal dashes, 4–12
//! characters ignoring the dashes, and mixes letters with digits. Obvious
//! false positives (pure-numeric runs, reserved words) are filtered here so
//! adapters stay dumb.

use std::collections::HashSet;

use once_cell::sync::OnceCell;
use regex::Regex;

/// Words that match the token shape but are never codes.
const RESERVED: &[&str] = &[
    "CODE", "CODES", "QR", "HTTP", "HTTPS", "WWW", "HTML", "JSON", "UTF8", "1080P", "720P",
    "H264", "MP4",
];

/// Normalize a candidate into its dedup key: trim whitespace, uppercase,
/// keep internal dashes. Idempotent.
pub fn normalize_code(s: &str) -> String {
    s.trim().to_ascii_uppercase()
}

fn token_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*\b").unwrap())
}

/// A token qualifies when its alphanumeric body (dashes ignored) is 4–12
/// chars and contains both a letter and a digit.
fn is_code_shaped(token: &str) -> bool {
    let body: String = token.chars().filter(|c| *c != '-').collect();
    let len = body.chars().count();
    if !(4..=12).contains(&len) {
        return false;
    }
    let has_alpha = body.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = body.chars().any(|c| c.is_ascii_digit());
    if !(has_alpha && has_digit) {
        return false;
    }
    let upper = normalize_code(token);
    !RESERVED.contains(&upper.as_str()) && !RESERVED.contains(&body.to_ascii_uppercase().as_str())
}

/// Extract normalized candidate codes from free text, first occurrence wins.
pub fn extract_codes(text: &str) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for m in token_re().find_iter(text) {
        let tok = m.as_str();
        if !is_code_shaped(tok) {
            continue;
        }
        let norm = normalize_code(tok);
        if seen.insert(norm.clone()) {
            out.push(norm);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for s in ["  abc-123 ", "ABC123", "a1-B2-c3", "  X9y8  "] {
            let once = normalize_code(s);
            assert_eq!(normalize_code(&once), once);
        }
    }

    #[test]
    fn extracts_mixed_tokens_and_keeps_dashes() {
        let text = "New drop: grab GEMS2024 and VIP-77-X before Friday!";
        let out = extract_codes(text);
        assert_eq!(out, vec!["GEMS2024".to_string(), "VIP-77-X".to_string()]);
    }

    #[test]
    fn rejects_pure_numeric_and_pure_alpha() {
        let out = extract_codes("call 18005551234 or visit shop page today");
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_reserved_words_and_length_outliers() {
        let out = extract_codes("scan the QR CODE at https example UTF8 a1 TOOLONGTOKEN12345X");
        assert!(out.is_empty());
    }

    #[test]
    fn dedups_repeated_mentions_case_insensitively() {
        let out = extract_codes("use Abc123 ... ABC123 works, abc123 confirmed");
        assert_eq!(out, vec!["ABC123".to_string()]);
    }
}
