//! Anthropic adapter for the Messages API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::types::Generation;
use super::{env_key, Generator};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, timeout)
    }

    /// Create from `ANTHROPIC_API_KEY` (and `ANTHROPIC_BASE_URL` if set).
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = env_key("ANTHROPIC_API_KEY")?;
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, timeout)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(&api_key.into())
            .map_err(|_| ProviderError::config("API key contains invalid header characters"))?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[derive(Serialize)]
struct MessagesApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesApiResponse {
    content: Option<Vec<ContentBlock>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[async_trait]
impl Generator for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, ProviderError> {
        let start = Instant::now();

        let api_req = MessagesApiRequest {
            model,
            max_tokens: MAX_TOKENS,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(self.messages_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<MessagesApiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_default();
            return Err(ProviderError::from_status(
                "anthropic",
                status.as_u16(),
                message,
            ));
        }

        let parsed: MessagesApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("anthropic", format!("Invalid JSON: {e}"), false)
        })?;

        let text = parsed
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProviderError::provider(
                "anthropic",
                "No text content in response",
                false,
            ));
        }

        let usage = parsed.usage;

        Ok(Generation {
            text,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            tokens_in: usage.as_ref().and_then(|u| u.input_tokens),
            tokens_out: usage.as_ref().and_then(|u| u.output_tokens),
            cost_usd: None,
            sources: Vec::new(),
            error: None,
        })
    }
}
