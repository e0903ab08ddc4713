use anyhow::{Context, Result};
use callscribe::{
    checkpoint::CheckpointStore,
    config::RunConfig,
    pipeline::{CommandBackend, FileFetcher, JsonlReportSink, ManifestSource},
    scheduler::Scheduler,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "callscribe")]
#[command(about = "Batch call-recording transcription across pooled rate-limited credentials")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Run configuration file (JSON)
    #[arg(long, default_value = "callscribe.json")]
    pub config: PathBuf,

    /// JSONL manifest of recording descriptors to process
    #[arg(long)]
    pub manifest: PathBuf,

    /// Directory the manifest's fetch references resolve against
    #[arg(long, default_value = ".")]
    pub audio_root: PathBuf,

    /// Checkpoint store directory
    #[arg(long, default_value = "callscribe-checkpoints")]
    pub checkpoint: PathBuf,

    /// Transcript output file (JSON lines)
    #[arg(long, default_value = "transcripts.jsonl")]
    pub transcripts: PathBuf,

    /// Transcription command; receives audio on stdin and prints the
    /// transcript to stdout
    #[arg(long)]
    pub transcribe_cmd: String,

    /// Environment variable the credential secret is passed through
    #[arg(long, default_value = "CALLSCRIBE_API_KEY")]
    pub secret_env: String,

    /// Write the run summary JSON to this path
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    // On non-Unix systems, just wait indefinitely
    futures::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Callscribe v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Config file: {}", args.config.display());
    info!("  Manifest: {}", args.manifest.display());
    info!("  Audio root: {}", args.audio_root.display());
    info!("  Checkpoints: {}", args.checkpoint.display());
    info!("  Transcripts: {}", args.transcripts.display());
    info!("  Transcribe command: {}", args.transcribe_cmd);

    let mut config = RunConfig::load(&args.config).context("failed to load run configuration")?;
    config
        .resolve_secrets()
        .context("failed to resolve credential secrets")?;
    info!(
        "  Credentials: {} (safety factor {:.2})",
        config.credentials.len(),
        config.safety_factor
    );

    let checkpoint =
        CheckpointStore::new(&args.checkpoint).context("failed to open checkpoint store")?;
    let fetcher = Arc::new(FileFetcher::new(&args.audio_root));
    let backend = Arc::new(
        CommandBackend::new(&args.transcribe_cmd, args.secret_env.as_str())
            .context("invalid transcribe command")?,
    );
    let sink = Arc::new(
        JsonlReportSink::create(&args.transcripts)
            .await
            .context("failed to open transcript file")?,
    );

    let scheduler = Scheduler::new(config, checkpoint, fetcher, backend, sink)
        .context("failed to create scheduler")?;

    let mut source = ManifestSource::open(&args.manifest)
        .await
        .context("failed to open manifest")?;
    scheduler
        .submit(&mut source)
        .await
        .context("failed to submit jobs")?;

    // Graceful shutdown on Ctrl+C or SIGTERM: stop dispatch, let
    // completed-stage writes finish
    let handle = scheduler.shutdown_handle();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
            _ = wait_for_term_signal() => info!("Received TERM signal"),
        }
        handle.shutdown();
    });

    let summary = scheduler.run().await.context("run failed")?;

    info!("Run summary: {}", summary);
    for usage in &summary.credential_usage {
        info!(
            "  {}: {} request(s), {:.0}s audio{}",
            usage.id,
            usage.requests,
            usage.audio_seconds,
            if usage.excluded { " (excluded)" } else { "" }
        );
    }
    for (kind, count) in &summary.failures_by_kind {
        info!("  failures[{}] = {}", kind, count);
    }

    if let Some(path) = &args.summary {
        let json = serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    if summary.failed > 0 {
        error!("{} job(s) failed permanently", summary.failed);
    }

    Ok(())
}
