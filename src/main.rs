use anyhow::Result;
use clap::{Parser, Subcommand};
use corpus_client::RedditApiClient;
use database::{BackupWriter, NewSubmission, SafePersister, SqliteStore};
use embedding_engine::{embedder_from_settings, Ranker};
use llm_interface::{EngineConfig, GeminiProvider, GenerationEngine, LlmProvider, OpenAiCompatibleProvider};
use personasim_core::{
    require_secret, AppConfig, CoreError, ErrorExt, ErrorReporter, GenerationSettings,
    ProviderSetting,
};
use pipeline::{format_results, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const QUOTA_PROBE_PROMPT: &str = "Hello! Please respond with just 'API Working'";

#[derive(Parser)]
#[command(name = "personasim", version, about = "Synthetic Reddit personas and comments")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true, env = "PERSONASIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate personas and comments for the latest submission.
    Run {
        /// Write the local backup only, skip the database insert.
        #[arg(long)]
        dry_run: bool,
    },
    /// Store a new target submission.
    Submit {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        flair: Option<String>,
        #[arg(long)]
        nsfw: bool,
    },
    /// Send one probe request to the configured model provider.
    CheckQuota,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("personasim=info".parse()?)
                .add_directive("pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).map_err(|e| report(e.into()))?;

    match cli.command {
        Command::Run { dry_run } => run(&config, dry_run).await,
        Command::Submit {
            title,
            body,
            category,
            flair,
            nsfw,
        } => {
            let submission = NewSubmission {
                title,
                body,
                category,
                flair,
                nsfw,
            };
            submit(&config, submission).await
        }
        Command::CheckQuota => check_quota(&config).await,
    }
}

async fn run(config: &AppConfig, dry_run: bool) -> Result<()> {
    info!("Starting personasim run");

    let store = Arc::new(open_store(config).await?);
    let fetcher = Arc::new(RedditApiClient::from_env(&config.corpus).map_err(report)?);
    let embedder = embedder_from_settings(&config.ranking).map_err(report)?;
    let ranker = Ranker::from_settings(embedder, &config.ranking);
    let provider = build_provider(&config.generation).map_err(report)?;
    let engine = Arc::new(GenerationEngine::new(
        provider,
        EngineConfig::from(&config.generation),
    ));

    let backup = BackupWriter::new(&config.storage.backup_dir);
    let persister = if dry_run {
        info!("Dry run: comments are only written to {}", backup.dir().display());
        SafePersister::backup_only(backup)
    } else {
        SafePersister::new(backup, store.clone(), config.storage.comments_table.clone())
    };

    let pipeline =
        Pipeline::new(config, fetcher.clone(), ranker, engine).with_persister(persister);
    let result = pipeline.run_latest(store.as_ref()).await;

    let limits = fetcher.get_rate_limit_status().await;
    info!(
        requests = limits.current_window_requests,
        remaining = limits.requests_remaining_in_window(),
        rate_limited = limits.rate_limited_requests,
        tokens = limits.available_tokens,
        burst = limits.max_tokens,
        "Reddit rate limit window"
    );

    println!("{}", format_results(&result));
    if let Some(reason) = &result.abort_reason {
        warn!("Run aborted: {}", reason);
    }
    Ok(())
}

async fn submit(config: &AppConfig, submission: NewSubmission) -> Result<()> {
    let store = open_store(config).await?;
    let target = store
        .insert_target(&submission)
        .await
        .map_err(|e| report(e.into()))?;
    println!("Stored submission {} in r/{}", target.id, target.category);
    Ok(())
}

async fn check_quota(config: &AppConfig) -> Result<()> {
    let provider = build_provider(&config.generation).map_err(report)?;
    info!("Probing {} ({})", provider.name(), config.generation.model);

    match provider.complete(QUOTA_PROBE_PROMPT, false).await {
        Ok(text) => {
            println!("Provider is working: {}", text.trim());
            Ok(())
        }
        Err(e) if e.is_quota_signature() => {
            println!("Quota or rate limit reached: {}", e);
            println!(
                "Wait for the quota window to reset, or raise generation.min_interval_secs"
            );
            Err(report(e.into()))
        }
        Err(e) => {
            println!("Probe failed: {}", e.user_friendly_message());
            Err(report(e.into()))
        }
    }
}

async fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.storage.database_url)
        .await
        .map_err(|e| report(e.into()))?;
    store.run_migrations().await.map_err(|e| report(e.into()))?;
    Ok(store)
}

fn build_provider(settings: &GenerationSettings) -> Result<Arc<dyn LlmProvider>, CoreError> {
    let timeout = Duration::from_secs(settings.request_timeout_secs);
    let api_key = require_secret(&api_key_var(settings))?;

    let provider: Arc<dyn LlmProvider> = match settings.provider {
        ProviderSetting::Gemini => Arc::new(
            GeminiProvider::new(api_key, settings.model.clone(), timeout)?
                .with_temperature(settings.temperature),
        ),
        ProviderSetting::OpenAi => Arc::new(
            OpenAiCompatibleProvider::new(
                api_key,
                settings.base_url.clone(),
                settings.model.clone(),
                timeout,
            )?
            .with_temperature(settings.temperature),
        ),
    };
    Ok(provider)
}

/// OpenAI-compatible providers read `OPENAI_API_KEY` unless another variable is configured.
fn api_key_var(settings: &GenerationSettings) -> String {
    let default_var = GenerationSettings::default().api_key_env;
    match settings.provider {
        ProviderSetting::OpenAi if settings.api_key_env == default_var => "OPENAI_API_KEY".to_string(),
        _ => settings.api_key_env.clone(),
    }
}

fn report(error: CoreError) -> anyhow::Error {
    ErrorReporter::new().report_error(&error);
    error.into()
}
