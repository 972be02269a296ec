use std::time::Duration;

use brandlens::provider::{
    AnthropicAdapter, GeminiAdapter, Generator, OpenAiAdapter, PerplexityAdapter, ProviderError,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn openai_parses_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "hello" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let generation = adapter.generate("hi", "gpt-4.1-mini").await.unwrap();

    assert_eq!(generation.text, "hello");
    assert_eq!(generation.tokens_in, Some(10));
    assert_eq!(generation.tokens_out, Some(20));
    assert!(generation.latency_ms.is_some());
    assert!(generation.sources.is_empty());
    assert!(!generation.is_failed());
}

#[tokio::test]
async fn openai_maps_429_to_rate_limited() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "rate limited" }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let err = adapter.generate("hi", "gpt-4.1-mini").await.unwrap_err();

    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn openai_maps_500_to_retryable_and_400_to_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "upstream exploded" }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let err = adapter.generate("hi", "gpt-4.1-mini").await.unwrap_err();
    assert!(err.is_retryable());

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model" }
        })))
        .mount(&server)
        .await;

    let err = adapter.generate("hi", "nope").await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn perplexity_citations_become_sources() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "answer" } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 7 },
            "citations": ["https://example.com/a", "https://example.org/b"]
        })))
        .mount(&server)
        .await;

    let adapter =
        PerplexityAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    // perplexity is always web-backed, both paths return citations
    let web = adapter.web_grounded().expect("perplexity is web-grounded");
    let generation = web.generate_web_grounded("hi", "sonar").await.unwrap();

    assert_eq!(generation.sources.len(), 2);
    assert_eq!(generation.sources[0].url, "https://example.com/a");
}

#[tokio::test]
async fn gemini_plain_call_omits_search_tool() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "flash says hi" }] } }],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 4 }
        })))
        .mount(&server)
        .await;

    let adapter =
        GeminiAdapter::with_config("key", server.uri(), Duration::from_secs(5)).unwrap();
    let generation = adapter.generate("hi", "gemini-2.5-flash").await.unwrap();

    assert_eq!(generation.text, "flash says hi");
    assert_eq!(generation.tokens_in, Some(3));
    assert_eq!(generation.tokens_out, Some(4));

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn gemini_web_grounded_sends_tool_and_reads_grounding_chunks() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "grounded answer" }] },
                "groundingMetadata": {
                    "groundingChunks": [
                        { "web": { "uri": "https://cited.com/page", "title": "Cited" } },
                        { "web": { "uri": "https://other.net/x" } }
                    ]
                }
            }],
            "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 2 }
        })))
        .mount(&server)
        .await;

    let adapter =
        GeminiAdapter::with_config("key", server.uri(), Duration::from_secs(5)).unwrap();
    let web = adapter.web_grounded().expect("gemini is web-grounded");
    let generation = web
        .generate_web_grounded("hi", "gemini-2.5-flash")
        .await
        .unwrap();

    assert_eq!(generation.text, "grounded answer");
    assert_eq!(generation.sources.len(), 2);
    assert_eq!(generation.sources[0].url, "https://cited.com/page");
    assert_eq!(generation.sources[0].title.as_deref(), Some("Cited"));
    assert_eq!(generation.sources[1].title, None);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("tools").is_some());
}

#[tokio::test]
async fn anthropic_joins_content_blocks() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "text": "part one " }, { "text": "part two" }],
            "usage": { "input_tokens": 8, "output_tokens": 9 }
        })))
        .mount(&server)
        .await;

    let adapter =
        AnthropicAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let generation = adapter
        .generate("hi", "claude-sonnet-4-20250514")
        .await
        .unwrap();

    assert_eq!(generation.text, "part one part two");
    assert_eq!(generation.tokens_in, Some(8));
    assert_eq!(generation.tokens_out, Some(9));
    assert!(adapter.web_grounded().is_none());
}

#[tokio::test]
async fn connection_failure_surfaces_as_http_error() {
    let adapter =
        OpenAiAdapter::with_config("sk-test", "http://127.0.0.1:9", Duration::from_secs(1))
            .unwrap();
    let err = adapter.generate("hi", "gpt-4.1-mini").await.unwrap_err();
    assert!(matches!(err, ProviderError::Http(_)));
    assert!(err.is_retryable());
}
