//! Brand presence scoring and competitor detection.
//!
//! Presence is a cheap lexical check over the answer text. Competitor
//! extraction delegates to an LLM classifier, then filters the tracked
//! brand's own variations out of whatever the classifier returns.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::provider::Generator;

const DOMAIN_TLDS: &str = "com|de|net|org|co|io";

/// Score whether the tracked brand is mentioned in `text`.
///
/// Returns `None` when no brand is configured (presence not expected),
/// otherwise 1.0 or 0.0. Matches the full name, any standalone brand word
/// longer than two characters, or domain-style spellings like `sunday.de`
/// and `sundaynatural.com`.
pub fn presence_score(text: &str, brand: &str) -> Option<f64> {
    let needle = brand.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    if text.is_empty() {
        return Some(0.0);
    }
    let hay = text.to_lowercase();

    if hay.contains(&needle) {
        return Some(1.0);
    }

    let words: Vec<&str> = needle.split_whitespace().filter(|w| w.len() > 2).collect();

    for word in &words {
        let pattern = format!(r"\b{}\b", regex::escape(word));
        // escaped literals always produce a valid pattern
        let re = Regex::new(&pattern).expect("valid regex");
        if re.is_match(&hay) {
            return Some(1.0);
        }
    }

    let no_spaces = needle.replace(' ', "");
    let domain = format!(r"\b{}\.({DOMAIN_TLDS})\b", regex::escape(&no_spaces));
    if Regex::new(&domain).expect("valid regex").is_match(&hay) {
        return Some(1.0);
    }

    if let Some(first) = words.first() {
        let first_domain = format!(r"\b{}\.({DOMAIN_TLDS})\b", regex::escape(first));
        if Regex::new(&first_domain).expect("valid regex").is_match(&hay) {
            return Some(1.0);
        }
    }

    Some(0.0)
}

static DOMAIN_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(com|de|co|net|org|io|uk|eu|fr|it|es)$").expect("valid regex"));

fn strip_separators(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '_'))
        .collect()
}

/// Drop the tracked brand and its variations from a detected-brand list.
///
/// Only the first word of a multi-word brand counts as distinctive:
/// for "Sunday Natural" we filter "Sunday" and "sunday.de" but keep
/// "Natural Elements", which only shares the second, generic word.
pub fn filter_brand_variations<I, S>(detected: I, tracked_brand: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let our_lower = tracked_brand.trim().to_lowercase();
    if our_lower.is_empty() {
        return detected
            .into_iter()
            .map(|b| b.as_ref().trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
    }

    let distinctive = our_lower.split_whitespace().next().unwrap_or("").to_string();
    let our_no_spaces = our_lower.replace(' ', "");

    let mut cleaned = BTreeSet::new();
    for brand in detected {
        let original = brand.as_ref().trim();
        if original.is_empty() {
            continue;
        }
        let lower = original.to_lowercase();
        let no_seps = strip_separators(&lower);

        let is_variation = if lower == our_lower || lower.contains(&our_lower) {
            true
        } else if lower == distinctive {
            true
        } else {
            let base = DOMAIN_SUFFIX_RE.replace(&lower, "").to_string();
            if base == our_no_spaces || base == distinctive {
                true
            } else {
                // prefix overlap like "sundaynatural.com" for "Sunday Natural",
                // but not unrelated names like "Sundance"
                !distinctive.is_empty()
                    && lower.starts_with(&distinctive)
                    && lower != distinctive
                    && (no_seps.starts_with(&our_no_spaces) || our_no_spaces.starts_with(&no_seps))
            }
        };

        if is_variation {
            debug!(brand = original, tracked = tracked_brand, "filtered own-brand variation");
        } else {
            cleaned.insert(original.to_string());
        }
    }
    cleaned
}

/// Extracts competitor brand names from a response text.
///
/// Infallible by contract: classification failures degrade to an empty
/// set so one flaky call never fails a run task.
#[async_trait]
pub trait CompetitorClassifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        industry: &str,
        market: &str,
        tracked_brand: &str,
    ) -> BTreeSet<String>;
}

/// Classifier that never detects anything. Used when no extraction
/// provider is configured.
pub struct NoopCompetitorClassifier;

#[async_trait]
impl CompetitorClassifier for NoopCompetitorClassifier {
    async fn classify(&self, _: &str, _: &str, _: &str, _: &str) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// LLM-backed competitor extraction with an optional fallback provider.
pub struct LlmCompetitorClassifier {
    primary: Arc<dyn Generator>,
    primary_model: String,
    fallback: Option<(Arc<dyn Generator>, String)>,
}

impl LlmCompetitorClassifier {
    pub fn new(primary: Arc<dyn Generator>, primary_model: impl Into<String>) -> Self {
        Self {
            primary,
            primary_model: primary_model.into(),
            fallback: None,
        }
    }

    /// Add a second provider tried when the primary errors or finds nothing.
    pub fn with_fallback(
        mut self,
        provider: Arc<dyn Generator>,
        model: impl Into<String>,
    ) -> Self {
        self.fallback = Some((provider, model.into()));
        self
    }

    async fn try_one(
        &self,
        generator: &Arc<dyn Generator>,
        model: &str,
        prompt: &str,
        tracked_brand: &str,
    ) -> BTreeSet<String> {
        match generator.generate(prompt, model).await {
            Ok(generation) => {
                let brands = parse_brand_array(&generation.text);
                filter_brand_variations(brands, tracked_brand)
            }
            Err(e) => {
                warn!(provider = generator.name(), error = %e, "competitor extraction failed");
                BTreeSet::new()
            }
        }
    }
}

#[async_trait]
impl CompetitorClassifier for LlmCompetitorClassifier {
    async fn classify(
        &self,
        text: &str,
        industry: &str,
        market: &str,
        tracked_brand: &str,
    ) -> BTreeSet<String> {
        if text.trim().chars().count() < 20 {
            return BTreeSet::new();
        }

        let prompt = extraction_prompt(text, industry, market, tracked_brand);

        let brands = self
            .try_one(&self.primary, &self.primary_model, &prompt, tracked_brand)
            .await;
        if !brands.is_empty() {
            return brands;
        }

        match &self.fallback {
            Some((provider, model)) => {
                self.try_one(provider, model, &prompt, tracked_brand).await
            }
            None => brands,
        }
    }
}

fn extraction_prompt(text: &str, industry: &str, market: &str, tracked_brand: &str) -> String {
    let excerpt: String = text.chars().take(3000).collect();

    let distinctive = tracked_brand.split_whitespace().next().unwrap_or("");
    let exclusion_hint = if !tracked_brand.is_empty() && !distinctive.is_empty() {
        format!(
            "\n   - CRITICAL: Exclude \"{tracked_brand}\" and shortened forms using \"{distinctive}\"\n   - BUT DO include competitor brands that merely share generic words with it"
        )
    } else {
        String::new()
    };

    format!(
        r#"Extract ONLY actual COMPETITOR company/brand names from the following text.

CONTEXT:
- Industry: {industry}
- Market/Country: {market}
- OUR brand to EXCLUDE: "{tracked_brand}"

RULES:
1. Return ONLY real company names and brand names that are COMPETITORS
2. DO NOT include country names, city names, generic words, or adjectives{exclusion_hint}
3. Consolidate variations of the same brand (full name, shortened name, domain) into ONE canonical form
4. Return as JSON array of strings with deduplicated canonical names only

TEXT TO ANALYZE:
{excerpt}

Return ONLY a JSON array like: ["Brand1", "Brand2", "Brand3"]
If no brands found, return: []"#
    )
}

/// Parse a JSON array of strings out of an LLM reply, tolerating markdown
/// fences and surrounding prose.
pub fn parse_brand_array(reply: &str) -> Vec<String> {
    let mut cleaned = reply.trim();
    if let Some(stripped) = cleaned.strip_prefix("```json") {
        cleaned = stripped;
    } else if let Some(stripped) = cleaned.strip_prefix("```") {
        cleaned = stripped;
    }
    cleaned = cleaned.trim_end_matches("```").trim();

    let start = match cleaned.find('[') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let end = match cleaned.rfind(']') {
        Some(i) if i > start => i,
        _ => return Vec::new(),
    };

    serde_json::from_str::<Vec<serde_json::Value>>(&cleaned[start..=end])
        .map(|values| {
            values
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_none_without_configured_brand() {
        assert_eq!(presence_score("any text", ""), None);
        assert_eq!(presence_score("any text", "   "), None);
    }

    #[test]
    fn presence_zero_for_empty_text() {
        assert_eq!(presence_score("", "Sunday Natural"), Some(0.0));
    }

    #[test]
    fn presence_exact_match_case_insensitive() {
        assert_eq!(
            presence_score("I recommend SUNDAY NATURAL for vitamins.", "Sunday Natural"),
            Some(1.0)
        );
    }

    #[test]
    fn presence_matches_standalone_brand_word() {
        assert_eq!(
            presence_score("Sunday offers a wide range.", "Sunday Natural"),
            Some(1.0)
        );
        // partial word does not count
        assert_eq!(
            presence_score("sunshine is great", "Sun Care"),
            Some(0.0)
        );
    }

    #[test]
    fn presence_skips_short_words() {
        // "of" is too short to count as a brand word
        assert_eq!(presence_score("house of things", "of Brandia"), Some(0.0));
    }

    #[test]
    fn presence_matches_domain_variants() {
        assert_eq!(
            presence_score("Check sundaynatural.com for details.", "Sunday Natural"),
            Some(1.0)
        );
        assert_eq!(
            presence_score("Check sunday.de for details.", "Sunday Natural"),
            Some(1.0)
        );
        assert_eq!(
            presence_score("Check sundance.de for details.", "Sunday Natural"),
            Some(0.0)
        );
    }

    #[test]
    fn filter_drops_exact_and_contains() {
        let out = filter_brand_variations(
            ["Sunday Natural", "Sunday Natural GmbH", "Nature Love"],
            "Sunday Natural",
        );
        assert_eq!(out, BTreeSet::from(["Nature Love".to_string()]));
    }

    #[test]
    fn filter_drops_distinctive_word_but_keeps_second_word_overlaps() {
        let out = filter_brand_variations(
            ["Sunday", "Natural Elements", "Nature Love"],
            "Sunday Natural",
        );
        assert!(!out.contains("Sunday"));
        assert!(out.contains("Natural Elements"));
        assert!(out.contains("Nature Love"));
    }

    #[test]
    fn filter_drops_distinctive_word_even_when_generic() {
        // the first word is always treated as a brand variation, even for
        // common words like "Nature"
        let out = filter_brand_variations(["Nature", "Globex"], "Nature Love");
        assert!(!out.contains("Nature"));
        assert!(out.contains("Globex"));
    }

    #[test]
    fn filter_drops_domain_variations() {
        let out = filter_brand_variations(
            ["sunday.de", "sundaynatural.com", "Sundance", "Sunflower Foods"],
            "Sunday Natural",
        );
        assert!(!out.contains("sunday.de"));
        assert!(!out.contains("sundaynatural.com"));
        assert!(out.contains("Sundance"));
        assert!(out.contains("Sunflower Foods"));
    }

    #[test]
    fn filter_without_tracked_brand_keeps_everything_trimmed() {
        let out = filter_brand_variations(["  Acme ", "", "Globex"], "");
        assert_eq!(
            out,
            BTreeSet::from(["Acme".to_string(), "Globex".to_string()])
        );
    }

    #[test]
    fn parses_plain_array() {
        assert_eq!(
            parse_brand_array(r#"["Acme", "Globex"]"#),
            vec!["Acme".to_string(), "Globex".to_string()]
        );
    }

    #[test]
    fn parses_fenced_array_with_prose() {
        let reply = "Here you go:\n```json\n[\"Acme\", \"Globex\"]\n```";
        assert_eq!(
            parse_brand_array(reply),
            vec!["Acme".to_string(), "Globex".to_string()]
        );
    }

    #[test]
    fn non_string_entries_are_skipped() {
        assert_eq!(parse_brand_array(r#"["Acme", 42, null]"#), vec!["Acme".to_string()]);
    }

    #[test]
    fn garbage_yields_empty() {
        assert!(parse_brand_array("no array here").is_empty());
        assert!(parse_brand_array("]broken[").is_empty());
    }
}
