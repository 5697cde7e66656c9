use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use feedback_forge::{
    AdapterConfig, ArtifactStore, Config, CurationPipeline, FeedbackFilter, FeedbackTag, HttpFallbackStore, HttpSafetyFilter,
    HttpTrainingDispatcher, LocalArtifactStore, NewFeedback, PgStore, SafetyFilter, VersionLifecycleManager,
};

#[derive(Parser)]
#[command(name = "feedback-forge", version, about = "Model version lifecycle and fine-tuning dispatch")]
struct Cli {
    /// JSON configuration file; environment variables are used when omitted.
    #[arg(long, global = true, env = "FEEDBACK_FORGE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the next model version for an organization.
    OpenVersion { org: Uuid },

    /// Record feedback against the deployed version.
    RecordFeedback {
        org: Uuid,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        response: String,
        #[arg(long)]
        corrected: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        rating: i16,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// List unclaimed feedback of the deployed version.
    Candidates {
        org: Uuid,
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        ratings: Vec<i16>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        has_correction: Option<bool>,
    },

    Attach { version: Uuid, feedback: Uuid },

    Detach { version: Uuid, feedback: Uuid },

    /// Curate attached feedback and publish the dataset.
    RequestTraining { version: Uuid },

    /// Lock an adapter configuration and dispatch training.
    ConfigureAdapter {
        version: Uuid,
        /// Adapter configuration as JSON.
        #[arg(long)]
        adapter: PathBuf,
        /// Return after submission instead of waiting for the job.
        #[arg(long)]
        no_wait: bool,
    },

    /// Check a dispatched job once and finalize it if done.
    PollTraining { version: Uuid },

    Versions { org: Uuid },

    Lineage { version: Uuid },

    /// Latest version with its selected feedback.
    Stats { org: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    config.ensure_directories()?;

    let manager = build_manager(&config).await?;
    run(&manager, cli.command).await
}

async fn build_manager(config: &Config) -> Result<VersionLifecycleManager> {
    let store = PgStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;
    store.health_check().await.context("database health check failed")?;

    let local: Arc<dyn ArtifactStore> = Arc::new(
        LocalArtifactStore::open(&config.storage.artifacts_dir, config.storage.public_base_url.clone())
            .await
            .context("failed to open artifact store")?,
    );
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(HttpFallbackStore::new(
        local,
        Duration::from_secs(config.training.request_timeout_secs),
    )?);

    let safety: Option<Arc<dyn SafetyFilter>> = match &config.safety {
        Some(safety) => {
            info!("Safety classifier enabled at {}", safety.service_url);
            let filter = HttpSafetyFilter::new(&safety.service_url, Duration::from_secs(safety.timeout_secs))?;
            Some(Arc::new(filter))
        }
        None => None,
    };
    let curation = CurationPipeline::new(config.curation.clone(), artifacts.clone(), safety)?;

    let dispatcher = HttpTrainingDispatcher::new(
        &config.training.service_url,
        Duration::from_secs(config.training.request_timeout_secs),
    )?;

    Ok(VersionLifecycleManager::new(
        Arc::new(store),
        artifacts,
        curation,
        Arc::new(dispatcher),
        config.wait_policy(),
    ))
}

async fn run(manager: &VersionLifecycleManager, command: Command) -> Result<()> {
    match command {
        Command::OpenVersion { org } => print(&manager.open_version(org).await?),
        Command::RecordFeedback {
            org,
            prompt,
            response,
            corrected,
            rating,
            tags,
        } => {
            let input = NewFeedback {
                prompt,
                model_response: response,
                corrected_response: corrected,
                rating,
                tags,
            };
            print(&manager.record_feedback(org, input).await?)
        }
        Command::Candidates {
            org,
            ratings,
            tags,
            has_correction,
        } => {
            let tags = tags
                .iter()
                .map(|t| t.parse::<FeedbackTag>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let filter = FeedbackFilter {
                ratings,
                tags,
                has_correction,
            };
            print(&manager.candidate_feedback(org, &filter).await?)
        }
        Command::Attach { version, feedback } => print(&manager.attach_feedback(version, feedback).await?),
        Command::Detach { version, feedback } => print(&manager.detach_feedback(version, feedback).await?),
        Command::RequestTraining { version } => print(&manager.request_training(version).await?),
        Command::ConfigureAdapter {
            version,
            adapter,
            no_wait,
        } => {
            let content = tokio::fs::read_to_string(&adapter)
                .await
                .with_context(|| format!("failed to read {}", adapter.display()))?;
            let adapter: AdapterConfig = serde_json::from_str(&content)?;
            if no_wait {
                print(&manager.submit_training(version, adapter).await?)
            } else {
                print(&manager.configure_adapter(version, adapter).await?)
            }
        }
        Command::PollTraining { version } => print(&manager.poll_training(version).await?),
        Command::Versions { org } => print(&manager.list_versions(org).await?),
        Command::Lineage { version } => print(&manager.lineage(version).await?),
        Command::Stats { org } => print(&manager.training_stats(org).await?),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
