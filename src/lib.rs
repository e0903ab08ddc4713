//! Callscribe - batch call-recording transcription with pooled credentials
//!
//! This crate schedules a large batch of independent fetch-then-transcribe
//! jobs against a pool of API credentials, each carrying two independent
//! rate limits (requests per minute and audio seconds per hour). It features:
//!
//! - Quota-aware credential selection that keeps every credential near but
//!   under its ceilings simultaneously
//! - Cooldown and permanent exclusion of rate-limited or revoked credentials
//! - A bounded worker pool with exponential, jittered retry backoff
//! - A sled-backed checkpoint store so a killed run resumes without
//!   reprocessing or double-billing already-transcribed audio
//!
//! # Example
//!
//! ```no_run
//! use callscribe::{
//!     checkpoint::CheckpointStore,
//!     config::RunConfig,
//!     pipeline::{CommandBackend, FileFetcher, JsonlReportSink, ManifestSource},
//!     scheduler::Scheduler,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load("callscribe.json")?;
//!     let checkpoint = CheckpointStore::new("checkpoints")?;
//!
//!     let fetcher = Arc::new(FileFetcher::new("recordings"));
//!     let backend = Arc::new(CommandBackend::new("transcribe-cli", "API_KEY")?);
//!     let sink = Arc::new(JsonlReportSink::create("transcripts.jsonl").await?);
//!
//!     let scheduler = Scheduler::new(config, checkpoint, fetcher, backend, sink)?;
//!     let mut source = ManifestSource::open("manifest.jsonl").await?;
//!     scheduler.submit(&mut source).await?;
//!
//!     let summary = scheduler.run().await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;

// Re-export commonly used types for convenience
pub use checkpoint::CheckpointStore;
pub use config::RunConfig;
pub use credentials::{CredentialLease, CredentialPool, CredentialSpec};
pub use pipeline::{BlobFetcher, CallLogSource, ReportSink, TranscriptionBackend};
pub use protocol::{
    CheckpointRecord, ErrorKind, Job, JobState, RecordingDescriptor, RunSummary, StageError,
};
pub use scheduler::{Scheduler, ShutdownHandle, SubmitStats};

// Error types
use thiserror::Error;

/// Errors that can occur in the callscribe engine
#[derive(Error, Debug)]
pub enum CallscribeError {
    /// Invalid run configuration; the only error that aborts before dispatch
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store misuse
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Underlying sled database failure
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Storage and adapter failures carrying added context
    #[error("{0}")]
    Internal(#[from] anyhow::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for callscribe operations
pub type Result<T> = std::result::Result<T, CallscribeError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
