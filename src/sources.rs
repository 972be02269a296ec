//! Fallback source extraction from response text.
//!
//! When a provider does not report the pages it consulted, we scrape URLs
//! out of the answer itself: markdown links first (they carry titles), then
//! any remaining bare URLs.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::provider::SourceRef;

static MD_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\]]{0,200})\]\((https?://[^\s)]+)\)").expect("valid regex")
});

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bhttps?://[^\s)\]]+").expect("valid regex"));

/// Extract cited URLs from free text, markdown links before bare URLs,
/// deduplicated by host (ignoring a `www.` prefix) and path.
pub fn extract_sources(text: &str) -> Vec<SourceRef> {
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut out = Vec::new();

    let mut push = |url: &str, title: Option<&str>| {
        let trimmed = url.trim_end_matches(|c| matches!(c, ')' | '.' | ',' | ';'));
        let Ok(parsed) = Url::parse(trimmed) else {
            return;
        };
        let host = parsed
            .host_str()
            .unwrap_or("")
            .to_lowercase()
            .trim_start_matches("www.")
            .to_string();
        if host.is_empty() {
            return;
        }
        let key = (host, parsed.path().to_string());
        if seen.contains(&key) {
            return;
        }
        seen.push(key);
        out.push(match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => SourceRef::titled(trimmed, t),
            None => SourceRef::new(trimmed),
        });
    };

    for cap in MD_LINK_RE.captures_iter(text) {
        push(&cap[2], Some(&cap[1]));
    }
    for m in URL_RE.find_iter(text) {
        push(m.as_str(), None);
    }

    out
}
