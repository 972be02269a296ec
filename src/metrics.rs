//! Per-response scoring and run-level aggregation.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::orchestrator::RunMode;
use crate::provider::SourceRef;

/// One scored provider answer within a run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub run_id: i64,
    pub provider: String,
    pub model: String,
    pub mode: RunMode,
    pub prompt_id: Option<String>,
    pub category: Option<String>,
    pub question: String,
    pub response_text: String,
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub presence: Option<f64>,
    pub sentiment: Option<f64>,
    pub trust_authority: Option<f64>,
    pub trust_brand: Option<f64>,
    pub brand_mentioned: bool,
    pub other_brands_detected: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub timestamp: DateTime<Utc>,
}

/// Share of run queries in which a competitor was detected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetitorShare {
    pub name: String,
    pub percent: f64,
}

/// Aggregated view over every completed task in a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub brand_name: String,
    pub total_queries: usize,
    /// Percentage of queries mentioning the tracked brand.
    pub overall_visibility: f64,
    pub avg_sentiment: Option<f64>,
    pub avg_trust: Option<f64>,
    pub provider_visibility: BTreeMap<String, f64>,
    pub competitor_visibility: Vec<CompetitorShare>,
}

/// Everything a finished run produces.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub results: Vec<QueryResult>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Aggregate scored results into a run summary.
///
/// Sentiment and trust averages skip unset values; competitor shares are
/// sorted by detection count (ties alphabetically) and capped at 15.
pub fn summarize(brand_name: &str, results: &[QueryResult]) -> RunSummary {
    let total = results.len();

    let mentioned = results.iter().filter(|r| r.brand_mentioned).count();
    let overall_visibility = if total > 0 {
        round2(mentioned as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    let sentiments: Vec<f64> = results.iter().filter_map(|r| r.sentiment).collect();
    let avg_sentiment = (!sentiments.is_empty())
        .then(|| round3(sentiments.iter().sum::<f64>() / sentiments.len() as f64));

    let trusts: Vec<f64> = results.iter().filter_map(|r| r.trust_authority).collect();
    let avg_trust =
        (!trusts.is_empty()).then(|| round3(trusts.iter().sum::<f64>() / trusts.len() as f64));

    let mut provider_totals: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for r in results {
        let entry = provider_totals.entry(&r.provider).or_default();
        entry.0 += 1;
        if r.brand_mentioned {
            entry.1 += 1;
        }
    }
    let provider_visibility = provider_totals
        .into_iter()
        .map(|(provider, (count, hits))| {
            (
                provider.to_string(),
                round2(hits as f64 / count as f64 * 100.0),
            )
        })
        .collect();

    let mut competitor_counts: HashMap<&str, usize> = HashMap::new();
    for r in results {
        for name in &r.other_brands_detected {
            *competitor_counts.entry(name).or_default() += 1;
        }
    }
    let mut counts: Vec<(&str, usize)> = competitor_counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let competitor_visibility = counts
        .into_iter()
        .take(15)
        .map(|(name, count)| CompetitorShare {
            name: name.to_string(),
            percent: round2(count as f64 / total as f64 * 100.0),
        })
        .collect();

    RunSummary {
        run_id: results.first().map(|r| r.run_id),
        brand_name: brand_name.to_string(),
        total_queries: total,
        overall_visibility,
        avg_sentiment,
        avg_trust,
        provider_visibility,
        competitor_visibility,
    }
}

static POSITIVE_TERMS: &[&str] = &[
    "excellent", "great", "good", "best", "top", "leading", "trusted", "reliable", "quality",
    "recommended", "popular", "innovative", "premium", "outstanding", "superior", "renowned",
    "reputable", "well-known", "high-quality", "effective",
];

static NEGATIVE_TERMS: &[&str] = &[
    "bad", "poor", "worst", "avoid", "unreliable", "scam", "overpriced", "disappointing",
    "controversial", "questionable", "mediocre", "inferior", "expensive", "complaints",
    "negative", "untrustworthy",
];

/// Crude lexicon sentiment: (positive - negative) / (positive + negative),
/// 0.0 when the text carries no sentiment terms.
pub fn sentiment_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let pos = POSITIVE_TERMS.iter().filter(|t| lower.contains(*t)).count() as f64;
    let neg = NEGATIVE_TERMS.iter().filter(|t| lower.contains(*t)).count() as f64;
    if pos + neg == 0.0 {
        0.0
    } else {
        (pos - neg) / (pos + neg)
    }
}

/// Scores how trustworthy the citation set looks.
pub trait TrustScorer: Send + Sync {
    /// Returns (authority score, brand-domain score); both unset when the
    /// response cites nothing.
    fn score(&self, text: &str, sources: &[SourceRef], brand: &str) -> (Option<f64>, Option<f64>);
}

static AUTHORITY_DOMAINS: &[&str] = &[
    "wikipedia.org",
    "nih.gov",
    "who.int",
    "webmd.com",
    "healthline.com",
    "mayoclinic.org",
    "examine.com",
    "consumerlab.com",
    "stiftung-warentest.de",
    "oekotest.de",
];

/// Domain-list heuristic: authority is the fraction of cited hosts on a
/// known-authority list (or .gov/.edu), brand trust the fraction pointing
/// at the tracked brand's own domain.
pub struct HeuristicTrustScorer;

impl HeuristicTrustScorer {
    fn host_of(source: &SourceRef) -> Option<String> {
        Url::parse(&source.url).ok().and_then(|u| {
            u.host_str()
                .map(|h| h.to_lowercase().trim_start_matches("www.").to_string())
        })
    }

    fn is_authority(host: &str) -> bool {
        AUTHORITY_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
            || host.ends_with(".gov")
            || host.ends_with(".edu")
    }
}

impl TrustScorer for HeuristicTrustScorer {
    fn score(&self, _text: &str, sources: &[SourceRef], brand: &str) -> (Option<f64>, Option<f64>) {
        let hosts: Vec<String> = sources.iter().filter_map(Self::host_of).collect();
        if hosts.is_empty() {
            return (None, None);
        }
        let total = hosts.len() as f64;

        let authority = hosts.iter().filter(|h| Self::is_authority(h)).count() as f64 / total;

        let brand_no_spaces = brand.trim().to_lowercase().replace(' ', "");
        let brand_hits = if brand_no_spaces.is_empty() {
            0.0
        } else {
            hosts
                .iter()
                .filter(|h| {
                    h.split('.').next().map(|base| base == brand_no_spaces).unwrap_or(false)
                })
                .count() as f64
        };

        (Some(round3(authority)), Some(round3(brand_hits / total)))
    }
}
