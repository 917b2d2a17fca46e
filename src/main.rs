use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use repo_curator::channels::{
    GitHubConfig, GitHubMetadataSource, MaildirConfig, MaildirSource,
};
use repo_curator::client::RateLimitedClient;
use repo_curator::config::{ClientConfig, PipelineConfig};
use repo_curator::error::{ConfigError, PipelineError};
use repo_curator::pipeline::{
    Collaborators, KeywordClassifier, MarkdownRenderer, PipelineCoordinator, RecoveryManager,
    RunPhase,
};
use repo_curator::store::{DurableStore, LibSqlBackend, StoreOptions};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    eprintln!("Repo Curator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Output: {}", config.output_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?
        .with_options(StoreOptions::from(&config));
    let store: Arc<dyn DurableStore> = Arc::new(backend);

    if std::env::args().nth(1).as_deref() == Some("reset") {
        store.reset_pipeline_state().await?;
        store.release().await?;
        eprintln!("   Pipeline state cleared.");
        return Ok(ExitCode::SUCCESS);
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let maildir = MaildirConfig::from_env()
        .ok_or_else(|| ConfigError::MissingEnvVar("CURATOR_MAILDIR".into()))?;
    eprintln!("   Maildir: {}", maildir.path.display());

    let collaborators = Collaborators {
        source: Arc::new(MaildirSource::new(maildir)),
        source_client: Arc::new(RateLimitedClient::new(&ClientConfig::from_env("maildir")?)),
        metadata: Arc::new(GitHubMetadataSource::new(GitHubConfig::from_env())),
        metadata_client: Arc::new(RateLimitedClient::new(&ClientConfig::from_env("github")?)),
        classifier: Arc::new(
            KeywordClassifier::default_rules().context("invalid classifier rules")?,
        ),
        classifier_client: Arc::new(RateLimitedClient::new(&ClientConfig::from_env(
            "classifier",
        )?)),
        renderer: Arc::new(MarkdownRenderer::default()),
    };

    // ── Shutdown ─────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight batches");
                cancel.cancel();
            }
        });
    }

    // ── Startup Recovery ────────────────────────────────────────────────
    let recovered = RecoveryManager::new(store.clone(), config.max_item_attempts)
        .recover()
        .await?;
    info!(
        requeued = recovered.requeued,
        abandoned = recovered.abandoned,
        "Startup recovery done"
    );

    let coordinator = PipelineCoordinator::new(store.clone(), config, collaborators, cancel);
    let outcome = coordinator.run_once().await;

    if let Err(e) = store.release().await {
        warn!(error = %e, "Failed to release owner record");
    }

    match outcome {
        Ok(summary) => {
            println!("{summary}");
            if summary.run.phase == RunPhase::Error {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(PipelineError::Cancelled) => {
            eprintln!("Run cancelled; it resumes on the next start.");
            Ok(ExitCode::from(130))
        }
        Err(e) => Err(e.into()),
    }
}

/// Console logging, plus a daily log file when `CURATOR_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("CURATOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "curator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();
    guard
}
