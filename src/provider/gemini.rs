//! Google Gemini adapter.
//!
//! Uses the `generateContent` endpoint. Web-grounded calls attach the
//! `google_search` tool and read cited pages back out of
//! `groundingMetadata.groundingChunks`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::types::{Generation, SourceRef};
use super::{env_key, Generator, WebGroundedGenerator};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, timeout)
    }

    /// Create from `GEMINI_API_KEY` (and `GEMINI_BASE_URL` if set).
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = env_key("GEMINI_API_KEY")?;
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
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
        headers.insert("x-goog-api-key", key);
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

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }

    async fn call(
        &self,
        prompt: &str,
        model: &str,
        web_search: bool,
    ) -> Result<Generation, ProviderError> {
        let start = Instant::now();

        let api_req = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            tools: web_search.then(|| [Tool { google_search: EmptyTool {} }]),
        };

        let response = self
            .client
            .post(self.generate_url(model))
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_default();
            return Err(ProviderError::from_status("gemini", status.as_u16(), message));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider("gemini", format!("Invalid JSON: {e}"), false))?;

        let candidate = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider("gemini", "No candidates in response", false))?;

        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let sources = candidate
            .grounding_metadata
            .and_then(|g| g.grounding_chunks)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.web)
            .filter_map(|w| {
                let uri = w.uri?;
                Some(match w.title {
                    Some(title) => SourceRef::titled(uri, title),
                    None => SourceRef::new(uri),
                })
            })
            .collect();

        let usage = parsed.usage_metadata;

        Ok(Generation {
            text,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            tokens_in: usage.as_ref().and_then(|u| u.prompt_token_count),
            tokens_out: usage.as_ref().and_then(|u| u.candidates_token_count),
            cost_usd: None,
            sources,
            error: None,
        })
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<[Tool; 1]>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Tool {
    google_search: EmptyTool,
}

#[derive(Serialize)]
struct EmptyTool {}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "groundingMetadata")]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GroundingMetadata {
    #[serde(rename = "groundingChunks")]
    grounding_chunks: Option<Vec<GroundingChunk>>,
}

#[derive(Deserialize)]
struct GroundingChunk {
    web: Option<WebChunk>,
}

#[derive(Deserialize)]
struct WebChunk {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[async_trait]
impl Generator for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, ProviderError> {
        self.call(prompt, model, false).await
    }

    fn web_grounded(&self) -> Option<&dyn WebGroundedGenerator> {
        Some(self)
    }
}

#[async_trait]
impl WebGroundedGenerator for GeminiAdapter {
    async fn generate_web_grounded(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<Generation, ProviderError> {
        self.call(prompt, model, true).await
    }
}
