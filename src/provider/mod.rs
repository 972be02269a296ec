//! Provider adapters for the LLM backends the engine can query.
//!
//! Each adapter wraps one vendor HTTP API behind the [`Generator`] trait.
//! Providers that can ground a response in live web search additionally
//! implement [`WebGroundedGenerator`] and advertise it via
//! [`Generator::web_grounded`].

pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod perplexity;
pub mod retry;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

pub use anthropic::AnthropicAdapter;
pub use error::ProviderError;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use perplexity::PerplexityAdapter;
pub use retry::{call_with_deadline, CallPolicy};
pub use types::{Generation, SourceRef};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_PERPLEXITY_MODEL: &str = "sonar";

/// A text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Stable provider name used in results, metrics rows, and logs.
    fn name(&self) -> &'static str;

    /// Run one prompt against the given model and return the raw generation.
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, ProviderError>;

    /// The web-grounded view of this provider, if it supports one.
    fn web_grounded(&self) -> Option<&dyn WebGroundedGenerator> {
        None
    }
}

/// A provider that can answer with live web search and report which pages it
/// consulted.
#[async_trait]
pub trait WebGroundedGenerator: Send + Sync {
    async fn generate_web_grounded(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<Generation, ProviderError>;
}

/// Default model for a provider name, if we know the provider.
pub fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some(DEFAULT_OPENAI_MODEL),
        "anthropic" => Some(DEFAULT_ANTHROPIC_MODEL),
        "gemini" => Some(DEFAULT_GEMINI_MODEL),
        "perplexity" => Some(DEFAULT_PERPLEXITY_MODEL),
        _ => None,
    }
}

/// Build every adapter whose API key is present in the environment.
///
/// Providers with missing keys are skipped with a warning rather than
/// failing the whole registry; a run that names a skipped provider fails
/// at validation instead.
pub fn providers_from_env(timeout: Duration) -> HashMap<String, Arc<dyn Generator>> {
    let mut providers: HashMap<String, Arc<dyn Generator>> = HashMap::new();

    match OpenAiAdapter::from_env(timeout) {
        Ok(p) => {
            providers.insert("openai".to_string(), Arc::new(p));
        }
        Err(e) => warn!(provider = "openai", error = %e, "provider unavailable"),
    }
    match AnthropicAdapter::from_env(timeout) {
        Ok(p) => {
            providers.insert("anthropic".to_string(), Arc::new(p));
        }
        Err(e) => warn!(provider = "anthropic", error = %e, "provider unavailable"),
    }
    match GeminiAdapter::from_env(timeout) {
        Ok(p) => {
            providers.insert("gemini".to_string(), Arc::new(p));
        }
        Err(e) => warn!(provider = "gemini", error = %e, "provider unavailable"),
    }
    match PerplexityAdapter::from_env(timeout) {
        Ok(p) => {
            providers.insert("perplexity".to_string(), Arc::new(p));
        }
        Err(e) => warn!(provider = "perplexity", error = %e, "provider unavailable"),
    }

    providers
}

/// Shared reqwest client builder for adapters that authenticate with a
/// bearer token.
pub(crate) fn bearer_client(api_key: &str, timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| ProviderError::config("API key contains invalid header characters"))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(ProviderError::Http)
}

pub(crate) fn env_key(var: &str) -> Result<String, ProviderError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ProviderError::config(format!("{var} is not set")))
}
