//! Run execution: fans a query panel out across providers, scores every
//! answer, and aggregates the run summary.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detect::{presence_score, CompetitorClassifier};
use crate::job::Job;
use crate::metrics::{sentiment_score, summarize, QueryResult, RunOutcome, TrustScorer};
use crate::provider::{call_with_deadline, CallPolicy, Generator};
use crate::sources::extract_sources;
use crate::store::{BrandRunRecord, NewMetrics, NewResponse, NewRun, RunStore, StoreError};

/// Hard ceiling on concurrent provider calls per run.
pub const MAX_CONCURRENCY_CEILING: usize = 16;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// How a run talks to providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Plain generation from model weights.
    Internal,
    /// Web-grounded generation where the provider supports it.
    ProviderWeb,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::ProviderWeb => "provider_web",
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "provider_web" => Ok(Self::ProviderWeb),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

/// One provider/model pair participating in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub model: String,
}

/// Full configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub brand_name: String,
    pub selections: Vec<ProviderSelection>,
    pub mode: RunMode,
    pub market: Option<String>,
    pub lang: Option<String>,
    pub industry: Option<String>,
    pub company_id: Option<String>,
    /// Send questions verbatim, without the market/language header.
    pub raw_prompts: bool,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub max_concurrency: usize,
}

impl RunConfig {
    pub fn new(brand_name: impl Into<String>, selections: Vec<ProviderSelection>, mode: RunMode) -> Self {
        Self {
            brand_name: brand_name.into(),
            selections,
            mode,
            market: None,
            lang: None,
            industry: None,
            company_id: None,
            raw_prompts: false,
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// One question from the query panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelQuery {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

impl PanelQuery {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            category: None,
            prompt_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode run outcome: {0}")]
    Encode(String),
}

enum TaskRun {
    Done(Box<QueryResult>),
    Degraded(String),
}

struct TaskOutcome {
    provider: String,
    question: String,
    run: Result<TaskRun, StoreError>,
}

/// Owns the provider registry and the scoring pipeline for runs.
pub struct Orchestrator {
    providers: HashMap<String, Arc<dyn Generator>>,
    classifier: Arc<dyn CompetitorClassifier>,
    trust: Arc<dyn TrustScorer>,
    store: Arc<dyn RunStore>,
}

impl Orchestrator {
    pub fn new(
        providers: HashMap<String, Arc<dyn Generator>>,
        classifier: Arc<dyn CompetitorClassifier>,
        trust: Arc<dyn TrustScorer>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            providers,
            classifier,
            trust,
            store,
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    fn validate(&self, config: &RunConfig, queries: &[PanelQuery]) -> Result<(), RunError> {
        if config.selections.is_empty() {
            return Err(RunError::InvalidConfig("no providers selected".into()));
        }
        if queries.is_empty() {
            return Err(RunError::InvalidConfig("no queries supplied".into()));
        }
        if config.max_concurrency == 0 || config.max_concurrency > MAX_CONCURRENCY_CEILING {
            return Err(RunError::InvalidConfig(format!(
                "max_concurrency must be between 1 and {MAX_CONCURRENCY_CEILING}"
            )));
        }
        for selection in &config.selections {
            if !self.providers.contains_key(&selection.provider) {
                return Err(RunError::InvalidConfig(format!(
                    "unknown provider: {}",
                    selection.provider
                )));
            }
        }
        Ok(())
    }

    /// Execute the full provider x query cross product, reporting progress
    /// through `job` and honoring its cancellation flag.
    pub async fn execute_run(
        &self,
        config: RunConfig,
        queries: Vec<PanelQuery>,
        job: &Job,
    ) -> Result<RunOutcome, RunError> {
        self.validate(&config, &queries)?;

        let total = config.selections.len() * queries.len();
        job.set_total(total);

        // sized to the actual task count so small runs don't hold idle slots
        let concurrency = config.max_concurrency.min(total).max(1);

        info!(
            brand = %config.brand_name,
            providers = config.selections.len(),
            queries = queries.len(),
            total,
            concurrency,
            mode = config.mode.as_str(),
            "starting run"
        );

        let config = Arc::new(config);
        let mut tasks = Vec::with_capacity(total);
        for selection in &config.selections {
            let generator = self.providers[&selection.provider].clone();
            for query in &queries {
                tasks.push((generator.clone(), selection.model.clone(), query.clone()));
            }
        }

        let mut results: Vec<QueryResult> = Vec::new();
        let classifier = self.classifier.clone();
        let trust = self.trust.clone();
        let store = self.store.clone();
        // Build the (lazy) task futures eagerly; keeping the closure out of
        // the stream type sidesteps a rustc "FnOnce is not general enough"
        // false positive when this future is spawned.
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|(generator, model, query)| {
                let config = config.clone();
                let classifier = classifier.clone();
                let trust = trust.clone();
                let store = store.clone();
                async move {
                    let provider = generator.name().to_string();
                    let question = query.question.clone();
                    if job.is_cancelled() {
                        return None;
                    }
                    let run =
                        run_one(&config, generator, &model, query, classifier, trust, store).await;
                    Some(TaskOutcome {
                        provider,
                        question,
                        run,
                    })
                }
            })
            .collect();
        let mut stream = stream::iter(futures).buffer_unordered(concurrency);

        // Drain the whole stream even after cancellation so tasks already
        // dispatched settle and their rows land in the store.
        while let Some(outcome) = stream.next().await {
            let Some(outcome) = outcome else {
                continue;
            };
            let label = truncate_query(&outcome.question);
            match outcome.run {
                Ok(TaskRun::Done(result)) => {
                    job.set_run_id(result.run_id);
                    job.record_completed(&outcome.provider, &label);
                    results.push(*result);
                }
                Ok(TaskRun::Degraded(error)) => {
                    warn!(provider = %outcome.provider, error = %error, "task degraded");
                    job.record_failed(&outcome.provider, &label);
                }
                Err(e) => {
                    warn!(provider = %outcome.provider, error = %e, "task failed to persist");
                    job.record_failed(&outcome.provider, &label);
                }
            }
        }

        let summary = summarize(&config.brand_name, &results);

        if !config.brand_name.trim().is_empty() && !results.is_empty() {
            if let Err(e) = self.record_brand_history(&config, job, &summary).await {
                // history is best effort, the run outcome stands either way
                warn!(error = %e, "failed to record brand run history");
            }
        }

        info!(
            total,
            completed = results.len(),
            visibility = summary.overall_visibility,
            "run finished"
        );

        Ok(RunOutcome { summary, results })
    }

    async fn record_brand_history(
        &self,
        config: &RunConfig,
        job: &Job,
        summary: &crate::metrics::RunSummary,
    ) -> Result<(), StoreError> {
        let brand_id = self
            .store
            .get_or_create_brand(
                &config.brand_name,
                config.industry.as_deref(),
                config.market.as_deref(),
                config.company_id.as_deref(),
            )
            .await?;
        let competitor_summary = serde_json::to_value(&summary.competitor_visibility)
            .map_err(|e| StoreError::Serde(e.to_string()))?;
        self.store
            .record_brand_run(BrandRunRecord {
                brand_id,
                job_id: Some(job.id.to_string()),
                providers: config
                    .selections
                    .iter()
                    .map(|s| s.provider.clone())
                    .collect(),
                mode: config.mode.as_str().to_string(),
                total_queries: summary.total_queries,
                visibility_pct: summary.overall_visibility,
                avg_sentiment: summary.avg_sentiment,
                avg_trust: summary.avg_trust,
                competitor_summary,
            })
            .await
    }
}

fn truncate_query(question: &str) -> String {
    let truncated: String = question.chars().take(50).collect();
    if truncated.chars().count() < question.chars().count() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

fn build_prompt(config: &RunConfig, question: &str) -> String {
    if config.raw_prompts {
        return question.to_string();
    }
    if config.market.is_some() || config.lang.is_some() {
        let market = config.market.as_deref().unwrap_or("-");
        let lang = config.lang.as_deref().unwrap_or("-");
        format!("(Market: {market}; Language: {lang})\n\n{question}")
    } else {
        question.to_string()
    }
}

async fn run_one(
    config: &RunConfig,
    generator: Arc<dyn Generator>,
    model: &str,
    query: PanelQuery,
    classifier: Arc<dyn CompetitorClassifier>,
    trust: Arc<dyn TrustScorer>,
    store: Arc<dyn RunStore>,
) -> Result<TaskRun, StoreError> {
    let prompt_text = build_prompt(config, &query.question);

    let run_id = store
        .insert_run(NewRun {
            provider: generator.name().to_string(),
            model: model.to_string(),
            prompt_id: query.prompt_id.clone(),
            category: query.category.clone(),
            mode: config.mode.as_str().to_string(),
            question: query.question.clone(),
            prompt_text: prompt_text.clone(),
            market: config.market.clone(),
            lang: config.lang.clone(),
            raw: config.raw_prompts,
            brand_name: config.brand_name.clone(),
            company_id: config.company_id.clone(),
        })
        .await?;

    let policy = CallPolicy {
        timeout: config.request_timeout,
        max_retries: config.max_retries,
        ..CallPolicy::default()
    };
    let label = format!("{}:{}", generator.name(), config.mode.as_str());

    let generation = match (config.mode, generator.web_grounded()) {
        (RunMode::ProviderWeb, Some(web)) => {
            call_with_deadline(&policy, &label, || {
                web.generate_web_grounded(&prompt_text, model)
            })
            .await
        }
        _ => {
            call_with_deadline(&policy, &label, || generator.generate(&prompt_text, model)).await
        }
    };

    let sources = if generation.sources.is_empty() {
        extract_sources(&generation.text)
    } else {
        generation.sources.clone()
    };

    store
        .insert_response(NewResponse {
            run_id,
            response_text: generation.text.clone(),
            latency_ms: generation.latency_ms,
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            cost_usd: generation.cost_usd,
            sources: sources.clone(),
        })
        .await?;

    if generation.is_failed() {
        return Ok(TaskRun::Degraded(
            generation.error.unwrap_or_else(|| "provider call failed".into()),
        ));
    }

    let other_brands = classifier
        .classify(
            &generation.text,
            config.industry.as_deref().unwrap_or(""),
            config.market.as_deref().unwrap_or(""),
            &config.brand_name,
        )
        .await;

    let presence = presence_score(&generation.text, &config.brand_name);
    let brand_mentioned = presence.map(|p| p > 0.0).unwrap_or(false);
    let sentiment = brand_mentioned.then(|| sentiment_score(&generation.text));
    let (trust_authority, trust_brand) =
        trust.score(&generation.text, &sources, &config.brand_name);

    let other_brands: Vec<String> = other_brands.into_iter().collect();

    store
        .insert_metrics(NewMetrics {
            run_id,
            presence,
            sentiment,
            trust_authority,
            trust_brand,
            brand_mentioned,
            other_brands: other_brands.clone(),
        })
        .await?;

    Ok(TaskRun::Done(Box::new(QueryResult {
        run_id,
        provider: generator.name().to_string(),
        model: model.to_string(),
        mode: config.mode,
        prompt_id: query.prompt_id,
        category: query.category,
        question: query.question,
        response_text: generation.text,
        latency_ms: generation.latency_ms,
        tokens_in: generation.tokens_in,
        tokens_out: generation.tokens_out,
        presence,
        sentiment,
        trust_authority,
        trust_brand,
        brand_mentioned,
        other_brands_detected: other_brands,
        sources,
        timestamp: chrono::Utc::now(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_round_trips_through_str() {
        assert_eq!("internal".parse::<RunMode>().unwrap(), RunMode::Internal);
        assert_eq!(
            "provider_web".parse::<RunMode>().unwrap(),
            RunMode::ProviderWeb
        );
        assert!("webby".parse::<RunMode>().is_err());
        assert_eq!(RunMode::ProviderWeb.as_str(), "provider_web");
    }

    #[test]
    fn prompt_header_carries_market_and_lang() {
        let mut config = RunConfig::new("Acme", vec![], RunMode::ProviderWeb);
        config.market = Some("Germany".into());
        config.lang = Some("de".into());
        assert_eq!(
            build_prompt(&config, "best vitamins?"),
            "(Market: Germany; Language: de)\n\nbest vitamins?"
        );
    }

    #[test]
    fn prompt_header_skipped_for_raw_and_unconfigured() {
        let mut config = RunConfig::new("Acme", vec![], RunMode::Internal);
        assert_eq!(build_prompt(&config, "q"), "q");
        config.market = Some("Germany".into());
        config.raw_prompts = true;
        assert_eq!(build_prompt(&config, "q"), "q");
    }

    #[test]
    fn missing_header_part_renders_dash() {
        let mut config = RunConfig::new("Acme", vec![], RunMode::Internal);
        config.lang = Some("en".into());
        assert_eq!(build_prompt(&config, "q"), "(Market: -; Language: en)\n\nq");
    }

    #[test]
    fn query_labels_are_truncated() {
        let long = "x".repeat(80);
        let label = truncate_query(&long);
        assert_eq!(label.chars().count(), 53);
        assert!(label.ends_with("..."));
        assert_eq!(truncate_query("short"), "short");
    }
}
