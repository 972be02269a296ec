#![forbid(unsafe_code)]

//! # brandlens
//!
//! Measures how visible a brand is in AI assistant answers.
//!
//! A run fans a panel of buyer-style questions out across several LLM
//! providers concurrently, scores every answer for brand presence,
//! sentiment, citation trust, and competitor mentions, and aggregates the
//! results into a visibility summary. Runs execute as background jobs with
//! pollable progress and cooperative cancellation, and every response is
//! persisted to SQLite for history.

pub mod detect;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod sources;
pub mod store;

pub use detect::{
    filter_brand_variations, parse_brand_array, presence_score, CompetitorClassifier,
    LlmCompetitorClassifier, NoopCompetitorClassifier,
};
pub use job::{Job, JobManager, JobSnapshot, JobStatus};
pub use metrics::{
    sentiment_score, summarize, CompetitorShare, HeuristicTrustScorer, QueryResult, RunOutcome,
    RunSummary, TrustScorer,
};
pub use orchestrator::{
    Orchestrator, PanelQuery, ProviderSelection, RunConfig, RunError, RunMode,
    DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY_CEILING,
};
pub use provider::{
    providers_from_env, Generation, Generator, ProviderError, SourceRef, WebGroundedGenerator,
};
pub use sources::extract_sources;
pub use store::{RunStore, SqliteRunStore, StoreError};
