use brandlens::provider::SourceRef;
use brandlens::store::{
    BrandRunRecord, NewMetrics, NewResponse, NewRun, RunStore, SqliteRunStore,
};
use serde_json::json;

fn sample_run() -> NewRun {
    NewRun {
        provider: "openai".into(),
        model: "gpt-4.1-mini".into(),
        prompt_id: Some("q_1".into()),
        category: Some("comparison".into()),
        mode: "internal".into(),
        question: "best vitamin shop?".into(),
        prompt_text: "best vitamin shop?".into(),
        market: Some("Germany".into()),
        lang: Some("de".into()),
        raw: false,
        brand_name: "Acme".into(),
        company_id: None,
    }
}

#[tokio::test]
async fn run_response_metrics_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRunStore::new(dir.path().join("t.sqlite")).unwrap();

    let run_id = store.insert_run(sample_run()).await.unwrap();
    assert_eq!(run_id, 1);

    store
        .insert_response(NewResponse {
            run_id,
            response_text: "Acme is solid".into(),
            latency_ms: Some(812),
            tokens_in: Some(10),
            tokens_out: Some(30),
            cost_usd: None,
            sources: vec![SourceRef::titled("https://example.com/x", "Example")],
        })
        .await
        .unwrap();

    store
        .insert_metrics(NewMetrics {
            run_id,
            presence: Some(1.0),
            sentiment: Some(0.5),
            trust_authority: Some(0.0),
            trust_brand: Some(0.0),
            brand_mentioned: true,
            other_brands: vec!["Globex".into()],
        })
        .await
        .unwrap();

    let conn = rusqlite::Connection::open(store.path()).unwrap();
    let (question, brand): (String, String) = conn
        .query_row(
            "SELECT question, brand_name FROM runs WHERE id = ?1",
            [run_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(question, "best vitamin shop?");
    assert_eq!(brand, "Acme");

    let sources_json: String = conn
        .query_row(
            "SELECT provider_sources FROM responses WHERE run_id = ?1",
            [run_id],
            |r| r.get(0),
        )
        .unwrap();
    let sources: Vec<SourceRef> = serde_json::from_str(&sources_json).unwrap();
    assert_eq!(sources[0].title.as_deref(), Some("Example"));

    let (mentioned, others): (i64, String) = conn
        .query_row(
            "SELECT brand_mentioned, other_brands FROM metrics WHERE run_id = ?1",
            [run_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(mentioned, 1);
    assert_eq!(others, r#"["Globex"]"#);
}

#[tokio::test]
async fn get_or_create_brand_is_idempotent_per_market() {
    let store = SqliteRunStore::in_memory().unwrap();

    let a = store
        .get_or_create_brand("Acme", Some("Supplements"), Some("Germany"), None)
        .await
        .unwrap();
    let b = store
        .get_or_create_brand("Acme", None, Some("Germany"), None)
        .await
        .unwrap();
    assert_eq!(a, b);

    // different market is a different brand row
    let c = store
        .get_or_create_brand("Acme", None, Some("France"), None)
        .await
        .unwrap();
    assert_ne!(a, c);

    // NULL market matches NULL market, not a named one
    let d = store.get_or_create_brand("Acme", None, None, None).await.unwrap();
    let e = store.get_or_create_brand("Acme", None, None, None).await.unwrap();
    assert_eq!(d, e);
    assert_ne!(d, a);
}

#[tokio::test]
async fn brand_run_history_accumulates() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRunStore::new(dir.path().join("h.sqlite")).unwrap();
    let brand_id = store
        .get_or_create_brand("Acme", None, None, None)
        .await
        .unwrap();

    for i in 0..2 {
        store
            .record_brand_run(BrandRunRecord {
                brand_id,
                job_id: Some(format!("job-{i}")),
                providers: vec!["openai".into(), "gemini".into()],
                mode: "internal".into(),
                total_queries: 10,
                visibility_pct: 40.0 + i as f64,
                avg_sentiment: Some(0.2),
                avg_trust: None,
                competitor_summary: json!([{ "name": "Globex", "percent": 20.0 }]),
            })
            .await
            .unwrap();
    }

    let conn = rusqlite::Connection::open(store.path()).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM brand_runs", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 2);
    let (providers, competitors): (String, String) = conn
        .query_row(
            "SELECT providers, competitor_summary FROM brand_runs LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(providers, r#"["openai","gemini"]"#);
    assert!(competitors.contains("Globex"));
}
