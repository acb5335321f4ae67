use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crag_core::config::{dirs_home, AppConfig, ModelConfig, WebSearchConfig};
use crag_core::event::EventBus;
use crag_core::traits::{EmbeddingProvider, EvidenceSource, LlmClient};
use crag_core::types::WorkflowEvent;

use crag_retrieval::{HttpEmbeddingProvider, Ingestor, LocalIndexSource, TavilySearch, VectorIndex};
use crag_workflow::{RunStatus, WorkflowEngine};

#[derive(Parser)]
#[command(
    name = "crag",
    version,
    about = "Answer questions from a local index or the web, checking every answer"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "crag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question (reads stdin when none is given)
    Ask {
        /// Print workflow progress to stderr
        #[arg(short, long)]
        verbose: bool,
        /// Print the full run outcome as JSON
        #[arg(long)]
        json: bool,
        /// The question
        #[arg(trailing_var_arg = true)]
        question: Vec<String>,
    },
    /// Build or update the local index from files or directories
    Index {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the answer
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crag=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&redacted(&config))?);
        }
        Commands::Index { paths } => {
            run_index(&config, &paths).await?;
        }
        Commands::Ask {
            verbose,
            json,
            question,
        } => {
            let mut text = question.join(" ");
            if text.trim().is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            if text.trim().is_empty() {
                anyhow::bail!("No question given");
            }

            let answered = ask(&config, text.trim(), verbose, json).await?;
            if !answered {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Run one question. Returns false when the run was unanswerable.
async fn ask(config: &AppConfig, question: &str, verbose: bool, json: bool) -> anyhow::Result<bool> {
    let llm: Arc<dyn LlmClient> = Arc::new(crag_llm::create_retrying_client(
        &config.model,
        &config.fallback_models,
    ));
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingProvider::from_config(&config.embedding));
    let local: Arc<dyn EvidenceSource> = Arc::new(LocalIndexSource::open(
        &config.index_path(),
        embedder,
        config.retrieval.top_k,
    ));
    let web: Arc<dyn EvidenceSource> = Arc::new(TavilySearch::from_config(&config.web_search));

    let event_bus = Arc::new(EventBus::default());
    let engine = WorkflowEngine::new(
        llm,
        config.model.clone(),
        config.retrieval.topics.clone(),
        local,
        web,
        config.workflow.clone(),
    )
    .with_event_bus(event_bus.clone());

    let print_handle = verbose.then(|| {
        let mut feed = event_bus.follow_next_run();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                eprintln!("{}", describe(&event));
            }
        })
    });

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let outcome = engine.answer_with_cancel(question, cancel).await;
    if let Some(handle) = print_handle {
        handle.await.ok();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(!matches!(outcome.status, RunStatus::Unanswerable { .. }));
    }

    match &outcome.status {
        RunStatus::Verified => {
            println!("{}", outcome.answer.as_deref().unwrap_or_default());
        }
        RunStatus::Unverified { reason } => {
            eprintln!("[unverified: {}]", reason);
            println!("{}", outcome.answer.as_deref().unwrap_or_default());
        }
        RunStatus::Unanswerable { error } => {
            eprintln!("Could not answer: {}", error);
            return Ok(false);
        }
    }

    if verbose {
        for passage in &outcome.documents {
            eprintln!("  source: {}", passage.source);
        }
    }
    Ok(true)
}

fn describe(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::RunStarted { run_id, .. } => format!("[run {}]", run_id),
        WorkflowEvent::NodeEntered {
            node,
            retry_count,
            requery_count,
            ..
        } => format!("[{}] retries={} requeries={}", node, retry_count, requery_count),
        WorkflowEvent::DocumentGraded {
            source, relevant, ..
        } => format!(
            "  {} {}",
            if *relevant { "relevant  " } else { "irrelevant" },
            source
        ),
        WorkflowEvent::RunComplete {
            verified,
            transitions,
            ..
        } => format!("[done] verified={} transitions={}", verified, transitions),
        WorkflowEvent::RunError { error, .. } => format!("[error] {}", error),
    }
}

async fn run_index(config: &AppConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let index_path = config.index_path();
    let index = VectorIndex::open(&index_path)?;
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingProvider::from_config(&config.embedding));

    if let Some(dims) = index.dimensions()? {
        if dims != embedder.dimensions() {
            anyhow::bail!(
                "Index at {} was built with {}-dim embeddings but the configured embedder produces {}; \
                 delete it or change embedding.dimensions",
                index_path.display(),
                dims,
                embedder.dimensions()
            );
        }
    }

    let ingestor = Ingestor::from_config(index, embedder, config);
    let (mut files, mut chunks) = (0, 0);
    for path in paths {
        let report = ingestor.ingest_path(path).await?;
        for skipped in &report.skipped {
            eprintln!("skipped {}", skipped.display());
        }
        files += report.files;
        chunks += report.chunks;
    }

    println!(
        "Indexed {} chunks from {} files into {} ({} chunks total)",
        chunks,
        files,
        index_path.display(),
        ingestor.index().len()?
    );
    Ok(())
}

/// Load the config file, then `~/.crag/config.toml`, then fall back to
/// environment variables.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    if let Some(home_config) = dirs_home().map(|h| h.join(".crag").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using environment variables");
    create_env_config()
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    let (provider, model_id, api_key) = if let Some(key) = env("GOOGLE_API_KEY").or(env("GEMINI_API_KEY")) {
        ("gemini", "gemini-2.5-flash", key)
    } else if let Some(key) = env("OPENAI_API_KEY") {
        ("openai", "gpt-4o-mini", key)
    } else if let Some(key) = env("ANTHROPIC_API_KEY") {
        ("anthropic", "claude-sonnet-4-20250514", key)
    } else {
        anyhow::bail!(
            "No config file found and no GOOGLE_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY set. \
             Create crag.toml (see crag.toml.example)."
        );
    };

    let mut embedding = crag_core::config::EmbeddingConfig::default();
    embedding.api_key = env("OPENAI_API_KEY");

    Ok(AppConfig {
        model: ModelConfig {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            api_key: Some(api_key),
            base_url: None,
            max_tokens: 2048,
            temperature: 0.0,
            retry: None,
        },
        fallback_models: vec![],
        retrieval: Default::default(),
        embedding,
        web_search: WebSearchConfig {
            api_key: env("TAVILY_API_KEY"),
            ..Default::default()
        },
        workflow: Default::default(),
    })
}

/// Copy of the config with secrets masked for display.
fn redacted(config: &AppConfig) -> AppConfig {
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("***".to_string());
        }
    };
    let mut shown = config.clone();
    mask(&mut shown.model.api_key);
    for fallback in &mut shown.fallback_models {
        mask(&mut fallback.api_key);
    }
    mask(&mut shown.embedding.api_key);
    mask(&mut shown.web_search.api_key);
    shown
}
