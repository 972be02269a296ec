//! Perplexity adapter.
//!
//! Perplexity's chat completions are always web-backed and return the
//! consulted URLs in a top-level `citations` array, so the adapter serves
//! both the plain and web-grounded roles.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::types::{Generation, SourceRef};
use super::{bearer_client, env_key, Generator, WebGroundedGenerator};

const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";

#[derive(Debug, Clone)]
pub struct PerplexityAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl PerplexityAdapter {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, timeout)
    }

    /// Create from `PERPLEXITY_API_KEY` (and `PERPLEXITY_BASE_URL` if set).
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = env_key("PERPLEXITY_API_KEY")?;
        let base_url =
            std::env::var("PERPLEXITY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, timeout)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: bearer_client(&api_key.into(), timeout)?,
            base_url: base_url.into(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn call(&self, prompt: &str, model: &str) -> Result<Generation, ProviderError> {
        let start = Instant::now();

        let api_req = ChatApiRequest {
            model,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_default();
            return Err(ProviderError::from_status(
                "perplexity",
                status.as_u16(),
                message,
            ));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("perplexity", format!("Invalid JSON: {e}"), false)
        })?;

        let text = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| {
                ProviderError::provider("perplexity", "No choices in response", false)
            })?;

        let sources = parsed
            .citations
            .unwrap_or_default()
            .into_iter()
            .map(SourceRef::new)
            .collect();

        let usage = parsed.usage;

        Ok(Generation {
            text,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            tokens_in: usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: usage.as_ref().and_then(|u| u.completion_tokens),
            cost_usd: None,
            sources,
            error: None,
        })
    }
}

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    citations: Option<Vec<String>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[async_trait]
impl Generator for PerplexityAdapter {
    fn name(&self) -> &'static str {
        "perplexity"
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, ProviderError> {
        self.call(prompt, model).await
    }

    fn web_grounded(&self) -> Option<&dyn WebGroundedGenerator> {
        Some(self)
    }
}

#[async_trait]
impl WebGroundedGenerator for PerplexityAdapter {
    async fn generate_web_grounded(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<Generation, ProviderError> {
        self.call(prompt, model).await
    }
}
