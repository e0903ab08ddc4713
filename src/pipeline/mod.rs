use async_trait::async_trait;

use crate::credentials::CredentialLease;
use crate::protocol::{RecordingDescriptor, ReportMetadata, StageError};

pub mod local;

pub use local::{CommandBackend, FileFetcher, JsonlReportSink, ManifestSource};

/// Lazy sequence of recording descriptors to process
///
/// The scheduler drains the source once during `submit`; already
/// checkpointed ids are filtered out before a job is ever created.
#[async_trait]
pub trait CallLogSource: Send {
    /// Yield the next descriptor, or None at the end of the log
    async fn next(&mut self) -> crate::Result<Option<RecordingDescriptor>>;
}

/// Turns a fetch reference into raw audio bytes
///
/// The fetch stage is not metered by the credential pool; it has its own,
/// typically more generous limiter (see the scheduler's fetch pacing).
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, fetch_ref: &str) -> Result<Vec<u8>, StageError>;
}

/// Turns audio bytes plus a credential into transcript text
///
/// Implementations must be safe to retry: the scheduler may re-transcribe
/// a recording whose checkpoint write was lost to a crash.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        credential: &CredentialLease,
    ) -> Result<String, StageError>;
}

/// Persists a finished transcript
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Write one result; returns an opaque output reference stored in the
    /// job's checkpoint record
    async fn write(
        &self,
        job_id: &str,
        text: &str,
        metadata: &ReportMetadata,
    ) -> crate::Result<String>;
}
