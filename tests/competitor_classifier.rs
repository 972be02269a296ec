use std::sync::Arc;
use std::time::Duration;

use brandlens::detect::{CompetitorClassifier, LlmCompetitorClassifier};
use brandlens::provider::OpenAiAdapter;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LONG_TEXT: &str = "A long answer naming several supplement shops in the German market.";

fn adapter(uri: String) -> Arc<OpenAiAdapter> {
    Arc::new(OpenAiAdapter::with_config("sk-test", uri, Duration::from_secs(5)).unwrap())
}

async fn brand_reply_server(reply: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": reply } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn classifier_filters_tracked_brand_from_reply() {
    let server =
        brand_reply_server(r#"["Globex", "Sunday", "Natural Elements", "sunday.de"]"#).await;
    let classifier = LlmCompetitorClassifier::new(adapter(server.uri()), "gpt-4.1-mini");

    let brands = classifier
        .classify(LONG_TEXT, "Supplements", "Germany", "Sunday Natural")
        .await;

    assert!(brands.contains("Globex"));
    assert!(brands.contains("Natural Elements"));
    assert!(!brands.contains("Sunday"));
    assert!(!brands.contains("sunday.de"));
}

#[tokio::test]
async fn classifier_tolerates_fenced_reply() {
    let server = brand_reply_server("```json\n[\"Acme Corp\"]\n```").await;
    let classifier = LlmCompetitorClassifier::new(adapter(server.uri()), "gpt-4.1-mini");

    let brands = classifier
        .classify(LONG_TEXT, "", "", "Sunday Natural")
        .await;
    assert!(brands.contains("Acme Corp"));
}

#[tokio::test]
async fn classifier_skips_short_texts_without_calling_anyone() {
    let server = brand_reply_server(r#"["Globex"]"#).await;
    let classifier = LlmCompetitorClassifier::new(adapter(server.uri()), "gpt-4.1-mini");

    let brands = classifier.classify("too short", "", "", "Acme").await;
    assert!(brands.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn fallback_provider_covers_primary_failure() {
    let dead = adapter("http://127.0.0.1:9".to_string());
    let server = brand_reply_server(r#"["Globex"]"#).await;
    let classifier = LlmCompetitorClassifier::new(dead, "gpt-4.1-mini")
        .with_fallback(adapter(server.uri()), "gemini-2.5-flash");

    let brands = classifier.classify(LONG_TEXT, "", "", "Acme").await;
    assert!(brands.contains("Globex"));
}

#[tokio::test]
async fn unparseable_reply_degrades_to_empty() {
    let server = brand_reply_server("I could not find any brands in the text.").await;
    let classifier = LlmCompetitorClassifier::new(adapter(server.uri()), "gpt-4.1-mini");

    let brands = classifier.classify(LONG_TEXT, "", "", "Acme").await;
    assert!(brands.is_empty());
}
