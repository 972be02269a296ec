#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use brandlens::detect::{CompetitorClassifier, LlmCompetitorClassifier, NoopCompetitorClassifier};
use brandlens::job::JobManager;
use brandlens::metrics::HeuristicTrustScorer;
use brandlens::orchestrator::{Orchestrator, PanelQuery, ProviderSelection, RunConfig, RunMode};
use brandlens::provider::{self, providers_from_env, Generator};
use brandlens::store::SqliteRunStore;

#[derive(Parser)]
#[command(name = "brandlens", version, about = "Brand visibility tracker for AI assistants")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a visibility run across providers
    Run {
        /// Brand name to track
        #[arg(long)]
        brand: String,
        /// Comma-separated providers, each optionally with a model
        /// (e.g. "openai,gemini:gemini-2.5-pro")
        #[arg(long, value_delimiter = ',')]
        providers: Vec<String>,
        /// File with one question per line
        #[arg(long)]
        queries: PathBuf,
        #[arg(long, default_value = "internal")]
        mode: String,
        #[arg(long)]
        market: Option<String>,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        industry: Option<String>,
        #[arg(long)]
        company_id: Option<String>,
        /// SQLite database path
        #[arg(long, default_value = "brandlens.sqlite")]
        db: PathBuf,
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        #[arg(long, default_value_t = 2)]
        max_retries: u32,
        #[arg(long, default_value_t = brandlens::DEFAULT_MAX_CONCURRENCY)]
        concurrency: usize,
        /// Send questions verbatim, without the market/language header
        #[arg(long)]
        raw: bool,
        /// Write the full outcome JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List providers available in this environment
    Models,
}

fn parse_selection(spec: &str) -> Result<ProviderSelection, String> {
    let (provider, model) = match spec.split_once(':') {
        Some((p, m)) => (p.trim(), Some(m.trim())),
        None => (spec.trim(), None),
    };
    if provider.is_empty() {
        return Err("empty provider name".to_string());
    }
    let model = match model {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => provider::default_model(provider)
            .ok_or_else(|| format!("no default model known for provider '{provider}'"))?
            .to_string(),
    };
    Ok(ProviderSelection {
        provider: provider.to_string(),
        model,
    })
}

fn load_queries(path: &PathBuf) -> Result<Vec<PanelQuery>, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PanelQuery::new)
        .collect())
}

fn build_classifier(
    providers: &HashMap<String, Arc<dyn Generator>>,
) -> Arc<dyn CompetitorClassifier> {
    let openai = providers.get("openai").cloned();
    let gemini = providers.get("gemini").cloned();
    match (openai, gemini) {
        (Some(primary), Some(fallback)) => Arc::new(
            LlmCompetitorClassifier::new(primary, provider::DEFAULT_OPENAI_MODEL)
                .with_fallback(fallback, provider::DEFAULT_GEMINI_MODEL),
        ),
        (Some(primary), None) => Arc::new(LlmCompetitorClassifier::new(
            primary,
            provider::DEFAULT_OPENAI_MODEL,
        )),
        (None, Some(primary)) => Arc::new(LlmCompetitorClassifier::new(
            primary,
            provider::DEFAULT_GEMINI_MODEL,
        )),
        (None, None) => Arc::new(NoopCompetitorClassifier),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Models => {
            let timeout = Duration::from_secs(10);
            let providers = providers_from_env(timeout);
            let mut names: Vec<&String> = providers.keys().collect();
            names.sort();
            if names.is_empty() {
                println!("no providers configured (set OPENAI_API_KEY, GEMINI_API_KEY, PERPLEXITY_API_KEY, or ANTHROPIC_API_KEY)");
            }
            for name in names {
                let default = provider::default_model(name).unwrap_or("-");
                let web = providers[name].web_grounded().is_some();
                println!(
                    "{name:<12} default model: {default:<28} web-grounded: {}",
                    if web { "yes" } else { "no" }
                );
            }
        }
        Commands::Run {
            brand,
            providers: provider_specs,
            queries,
            mode,
            market,
            lang,
            industry,
            company_id,
            db,
            timeout,
            max_retries,
            concurrency,
            raw,
            out,
        } => {
            let timeout = Duration::from_secs(timeout);
            let selections = provider_specs
                .iter()
                .map(|s| parse_selection(s))
                .collect::<Result<Vec<_>, _>>()?;
            let panel = load_queries(&queries)?;

            let registry = providers_from_env(timeout);
            let classifier = build_classifier(&registry);
            let store = Arc::new(SqliteRunStore::new(&db)?);

            let orchestrator = Arc::new(Orchestrator::new(
                registry,
                classifier,
                Arc::new(HeuristicTrustScorer),
                store,
            ));

            let mut config = RunConfig::new(brand, selections, RunMode::from_str(&mode)?);
            config.market = market;
            config.lang = lang;
            config.industry = industry;
            config.company_id = company_id;
            config.raw_prompts = raw;
            config.request_timeout = timeout;
            config.max_retries = max_retries;
            config.max_concurrency = concurrency;

            let manager = Arc::new(JobManager::new());
            manager.spawn_eviction(Duration::from_secs(300), Duration::from_secs(3600));

            let run_orchestrator = orchestrator.clone();
            let job = manager.submit(move |job| async move {
                let outcome = run_orchestrator.execute_run(config, panel, &job).await?;
                serde_json::to_value(&outcome)
                    .map_err(|e| brandlens::orchestrator::RunError::Encode(e.to_string()))
            });

            eprintln!("job {}", job.id);
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let snapshot = job.snapshot();
                eprint!(
                    "\r{:>6.2}% ({}/{} done, {} failed){}",
                    snapshot.progress_percent,
                    snapshot.completed_tasks,
                    snapshot.total_tasks,
                    snapshot.failed_tasks,
                    match &snapshot.current_provider {
                        Some(p) => format!(" [{p}]"),
                        None => String::new(),
                    }
                );
                if snapshot.status.is_terminal() {
                    eprintln!();
                    break;
                }
            }

            let snapshot = job.snapshot();
            if let Some(error) = snapshot.error {
                return Err(error.into());
            }
            let result = job.result().unwrap_or(serde_json::Value::Null);
            let rendered = serde_json::to_string_pretty(&result)?;
            match out {
                Some(path) => std::fs::write(path, rendered)?,
                None => println!("{rendered}"),
            }
        }
    }

    Ok(())
}
