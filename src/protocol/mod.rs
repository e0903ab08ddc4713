use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Recording descriptor yielded by a call log source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingDescriptor {
    /// Stable identifier, derived from the source recording id
    pub id: String,
    /// Opaque reference the blob fetcher resolves to raw audio bytes
    pub fetch_ref: String,
    /// Estimated audio duration in seconds; 0 when unknown before fetch
    #[serde(default)]
    pub estimated_duration_seconds: f64,
    /// Optional caller metadata carried through to the report sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl RecordingDescriptor {
    /// Create a new descriptor with the given id, fetch reference and estimate
    pub fn new(
        id: impl Into<String>,
        fetch_ref: impl Into<String>,
        estimated_duration_seconds: f64,
    ) -> Self {
        Self {
            id: id.into(),
            fetch_ref: fetch_ref.into(),
            estimated_duration_seconds,
            metadata: None,
        }
    }
}

/// Lifecycle states of a job
///
/// Done, Failed and Skipped are terminal; a job is never deleted, only
/// transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Fetching,
    Fetched,
    Transcribing,
    Done,
    Failed,
    Skipped,
}

impl JobState {
    /// Whether this state ends the job's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Fetching => "fetching",
            JobState::Fetched => "fetched",
            JobState::Transcribing => "transcribing",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A single unit of work: fetch one recording, transcribe it
#[derive(Debug, Clone)]
pub struct Job {
    /// Stable job id, taken from the descriptor
    pub id: String,
    /// Reference handed to the blob fetcher
    pub fetch_ref: String,
    /// Duration estimate used for quota admission
    pub estimated_duration_seconds: f64,
    /// Current lifecycle state
    pub state: JobState,
    /// Number of transient attempts consumed so far
    pub attempt_count: u32,
    /// Message of the most recent failure, if any
    pub last_error: Option<String>,
    /// Caller metadata from the descriptor
    pub metadata: Option<HashMap<String, String>>,
    /// Fetched audio bytes, kept across transcribe retries so a requeued
    /// job does not re-fetch
    pub audio: Option<Vec<u8>>,
}

impl Job {
    /// Build a pending job from a descriptor
    pub fn from_descriptor(descriptor: RecordingDescriptor) -> Self {
        Self {
            id: descriptor.id,
            fetch_ref: descriptor.fetch_ref,
            estimated_duration_seconds: descriptor.estimated_duration_seconds,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            metadata: descriptor.metadata,
            audio: None,
        }
    }
}

/// Classification of a stage failure
///
/// The scheduler's handling is driven entirely by this kind: transient
/// failures retry with backoff, rate limits cool the credential down,
/// invalid input fails the job immediately, auth failures exclude the
/// credential, and fatal errors abort the run before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network timeout, 5xx; worth retrying with backoff
    Transient,
    /// 429 / quota-exceeded signal from the provider
    RateLimited,
    /// Corrupt or undecodable audio; retrying cannot help
    InvalidInput,
    /// Credential revoked or expired
    AuthFailure,
    /// Configuration problem; aborts the run
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase name used in logs and summary maps
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a pipeline stage (fetch or transcribe)
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// Failure classification driving the scheduler's response
    pub kind: ErrorKind,
    /// Human-readable detail for logs and checkpoint records
    pub message: String,
}

impl StageError {
    /// Create a stage error with an explicit kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Network timeout / 5xx style failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// 429 / quota-exceeded rejection
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// Undecodable or unsupported input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Revoked or expired credential
    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, message)
    }

    /// Unrecoverable configuration problem
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Durable record of a job's terminal outcome
///
/// At most one record per job id is authoritative (the latest); a resumed
/// run skips any id whose record is already terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Job this record belongs to
    pub job_id: String,
    /// Terminal state reached (Done, Failed or Skipped)
    pub final_state: JobState,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
    /// Opaque handle to the persisted transcript, when Done
    pub output_ref: Option<String>,
}

impl CheckpointRecord {
    /// Create a record stamped with the current time
    pub fn new(job_id: impl Into<String>, final_state: JobState, output_ref: Option<String>) -> Self {
        Self {
            job_id: job_id.into(),
            final_state,
            timestamp: Utc::now(),
            output_ref,
        }
    }

    /// Serialize this record to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Metadata handed to the report sink alongside the transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Audio duration estimate the job was admitted with
    pub duration_seconds: f64,
    /// Credential that produced the transcript
    pub credential_id: String,
    /// Transient attempts the job consumed
    pub attempt_count: u32,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Caller metadata from the descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, String>>,
}

/// Lifetime usage totals for one credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUsage {
    /// Configured credential id
    pub id: String,
    /// Total requests committed over the run
    pub requests: u64,
    /// Total audio seconds committed over the run
    pub audio_seconds: f64,
    /// Whether the credential was permanently excluded
    pub excluded: bool,
}

/// End-of-run summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Correlation id of the run that produced this summary
    pub run_id: String,
    /// Jobs transcribed and checkpointed Done
    pub processed: u64,
    /// Jobs below the minimum duration threshold
    pub skipped: u64,
    /// Jobs that exhausted retries or hit unretryable errors
    pub failed: u64,
    /// Wall-clock run duration in seconds
    pub duration_seconds: f64,
    /// Failure counts keyed by error kind name
    pub failures_by_kind: HashMap<String, u64>,
    /// Per-credential usage totals
    pub credential_usage: Vec<CredentialUsage>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={}, skipped={}, failed={}, elapsed={:.1}s",
            self.processed, self.skipped, self.failed, self.duration_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Skipped.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Fetching.is_terminal());
        assert!(!JobState::Transcribing.is_terminal());
    }

    #[test]
    fn test_descriptor_json_roundtrip() {
        let descriptor = RecordingDescriptor::new("rec-42", "calls/rec-42.mp3", 87.5);
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: RecordingDescriptor = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, "rec-42");
        assert_eq!(back.fetch_ref, "calls/rec-42.mp3");
        assert_eq!(back.estimated_duration_seconds, 87.5);
    }

    #[test]
    fn test_descriptor_duration_defaults_to_zero() {
        let descriptor: RecordingDescriptor =
            serde_json::from_str(r#"{"id":"rec-1","fetch_ref":"a.mp3"}"#).unwrap();
        assert_eq!(descriptor.estimated_duration_seconds, 0.0);
    }

    #[test]
    fn test_checkpoint_record_serialization() {
        let record = CheckpointRecord::new("rec-7", JobState::Done, Some("out/rec-7".to_string()));

        let bytes = record.to_bytes().unwrap();
        let back = CheckpointRecord::from_bytes(&bytes).unwrap();

        assert_eq!(back.job_id, "rec-7");
        assert_eq!(back.final_state, JobState::Done);
        assert_eq!(back.output_ref.as_deref(), Some("out/rec-7"));
    }

    #[test]
    fn test_stage_error_kinds() {
        assert_eq!(StageError::transient("timeout").kind, ErrorKind::Transient);
        assert_eq!(StageError::rate_limited("429").kind, ErrorKind::RateLimited);
        assert_eq!(StageError::invalid_input("bad wav").kind, ErrorKind::InvalidInput);
        assert_eq!(StageError::auth_failure("revoked").kind, ErrorKind::AuthFailure);
        assert_eq!(StageError::fatal("no credentials").kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::rate_limited("quota exceeded");
        assert_eq!(err.to_string(), "rate_limited: quota exceeded");
    }

    #[test]
    fn test_job_from_descriptor() {
        let job = Job::from_descriptor(RecordingDescriptor::new("rec-1", "a.mp3", 12.0));
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.audio.is_none());
        assert!(job.last_error.is_none());
    }
}
