use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::Command;
use tracing::debug;

use super::{BlobFetcher, CallLogSource, ReportSink, TranscriptionBackend};
use crate::credentials::CredentialLease;
use crate::protocol::{RecordingDescriptor, ReportMetadata, StageError};

/// Call log source backed by a JSONL manifest file, one
/// `RecordingDescriptor` per line
pub struct ManifestSource {
    lines: Lines<BufReader<File>>,
    line_number: u64,
}

impl ManifestSource {
    /// Open a manifest for reading
    pub async fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = File::open(&path).await.with_context(|| {
            format!("failed to open manifest {}", path.as_ref().display())
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

#[async_trait]
impl CallLogSource for ManifestSource {
    async fn next(&mut self) -> crate::Result<Option<RecordingDescriptor>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    self.line_number += 1;
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    let descriptor = serde_json::from_str(trimmed)
                        .with_context(|| format!("invalid manifest line {}", self.line_number))?;
                    return Ok(Some(descriptor));
                }
            }
        }
    }
}

/// Blob fetcher resolving fetch references against a local directory
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    /// Create a fetcher rooted at the given directory
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BlobFetcher for FileFetcher {
    async fn fetch(&self, fetch_ref: &str) -> Result<Vec<u8>, StageError> {
        let path = self.root.join(fetch_ref);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!("Fetched {} ({} bytes)", path.display(), bytes.len());
                Ok(bytes)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                StageError::invalid_input(format!("no such audio blob: {}", path.display())),
            ),
            Err(err) => Err(StageError::transient(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }
}

/// Transcription backend that runs an external command per job
///
/// The command receives the audio bytes on stdin and the credential secret
/// through an environment variable, and prints the transcript to stdout.
/// Failures are classified from the exit status and stderr text.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    secret_env: String,
}

impl CommandBackend {
    /// Build a backend from a whitespace-separated command line
    pub fn new(command_line: &str, secret_env: impl Into<String>) -> crate::Result<Self> {
        let mut parts = command_line.split_whitespace().map(|s| s.to_string());
        let program = parts.next().ok_or_else(|| {
            crate::CallscribeError::Config("transcribe command is empty".to_string())
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            secret_env: secret_env.into(),
        })
    }
}

#[async_trait]
impl TranscriptionBackend for CommandBackend {
    async fn transcribe(
        &self,
        audio: &[u8],
        credential: &CredentialLease,
    ) -> Result<String, StageError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(&self.secret_env, &credential.secret)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StageError::transient(format!("failed to spawn transcriber: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StageError::transient("failed to open transcriber stdin"))?;
        stdin
            .write_all(audio)
            .await
            .map_err(|e| StageError::transient(format!("failed to write audio to transcriber: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("transcriber did not exit cleanly: {e}")))?;

        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                return Err(StageError::invalid_input("transcriber produced no output"));
            }
            return Ok(text);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_backend_failure(&stderr, output.status.code()))
    }
}

/// Map an external transcriber failure onto the error taxonomy using the
/// provider signals that show up in stderr
fn classify_backend_failure(stderr: &str, code: Option<i32>) -> StageError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("rate_limit") {
        StageError::rate_limited(first_line(stderr))
    } else if lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("unauthorized")
        || lowered.contains("invalid api key")
    {
        StageError::auth_failure(first_line(stderr))
    } else if lowered.contains("unsupported format")
        || lowered.contains("could not decode")
        || lowered.contains("invalid audio")
    {
        StageError::invalid_input(first_line(stderr))
    } else {
        StageError::transient(format!(
            "transcriber exited with {:?}: {}",
            code,
            first_line(stderr)
        ))
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").chars().take(200).collect()
}

/// Report sink appending one JSON line per transcript
pub struct JsonlReportSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    lines: AtomicU64,
}

#[derive(Serialize)]
struct ReportLine<'a> {
    job_id: &'a str,
    text: &'a str,
    metadata: &'a ReportMetadata,
}

impl JsonlReportSink {
    /// Open (or create) the transcript file for appending
    pub async fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existing_lines = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.lines().count() as u64,
            Err(_) => 0,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open transcript file {}", path.display()))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            lines: AtomicU64::new(existing_lines),
        })
    }
}

#[async_trait]
impl ReportSink for JsonlReportSink {
    async fn write(
        &self,
        job_id: &str,
        text: &str,
        metadata: &ReportMetadata,
    ) -> crate::Result<String> {
        let mut line = serde_json::to_string(&ReportLine {
            job_id,
            text,
            metadata,
        })?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        let line_number = self.lines.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}:{}", self.path.display(), line_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn lease() -> CredentialLease {
        CredentialLease {
            id: "test".to_string(),
            secret: "secret".to_string(),
            audio_seconds: 10.0,
        }
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            duration_seconds: 10.0,
            credential_id: "test".to_string(),
            attempt_count: 0,
            completed_at: Utc::now(),
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_manifest_source_reads_descriptors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"id":"rec-1","fetch_ref":"a.mp3","estimated_duration_seconds":30.0}"#,
                "\n\n# comment\n",
                r#"{"id":"rec-2","fetch_ref":"b.mp3"}"#,
                "\n",
            ),
        )
        .unwrap();

        let mut source = ManifestSource::open(&path).await.unwrap();
        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.id, "rec-1");
        assert_eq!(first.estimated_duration_seconds, 30.0);

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.id, "rec-2");
        assert_eq!(second.estimated_duration_seconds, 0.0);

        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manifest_source_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let mut source = ManifestSource::open(&path).await.unwrap();
        assert!(source.next().await.is_err());
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_blob() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("rec-1.mp3"), b"audio-bytes").unwrap();

        let fetcher = FileFetcher::new(dir.path());
        let bytes = fetcher.fetch("rec-1.mp3").await.unwrap();
        assert_eq!(bytes, b"audio-bytes");
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_blob_is_invalid_input() {
        let dir = TempDir::new().unwrap();
        let fetcher = FileFetcher::new(dir.path());

        let err = fetcher.fetch("missing.mp3").await.unwrap_err();
        assert_eq!(err.kind, crate::protocol::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_pipes_audio_through() {
        let backend = CommandBackend::new("cat", "CALLSCRIBE_API_KEY").unwrap();
        let text = backend.transcribe(b"hello transcript", &lease()).await.unwrap();
        assert_eq!(text, "hello transcript");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_failure_is_transient_by_default() {
        let backend = CommandBackend::new("false", "CALLSCRIBE_API_KEY").unwrap();
        let err = backend.transcribe(b"audio", &lease()).await.unwrap_err();
        assert_eq!(err.kind, crate::protocol::ErrorKind::Transient);
    }

    #[test]
    fn test_empty_command_is_a_config_error() {
        assert!(CommandBackend::new("   ", "KEY").is_err());
    }

    #[test]
    fn test_backend_failure_classification() {
        use crate::protocol::ErrorKind;

        assert_eq!(
            classify_backend_failure("HTTP 429 rate limit exceeded", Some(1)).kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_backend_failure("401 Unauthorized", Some(1)).kind,
            ErrorKind::AuthFailure
        );
        assert_eq!(
            classify_backend_failure("could not decode audio stream", Some(1)).kind,
            ErrorKind::InvalidInput
        );
        assert_eq!(
            classify_backend_failure("connection reset by peer", Some(1)).kind,
            ErrorKind::Transient
        );
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_and_numbers_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transcripts.jsonl");

        let sink = JsonlReportSink::create(&path).await.unwrap();
        let first = sink.write("rec-1", "hello", &metadata()).await.unwrap();
        let second = sink.write("rec-2", "world", &metadata()).await.unwrap();

        assert!(first.ends_with(":1"));
        assert!(second.ends_with(":2"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("rec-1"));
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn test_jsonl_sink_resumes_line_numbers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transcripts.jsonl");

        {
            let sink = JsonlReportSink::create(&path).await.unwrap();
            sink.write("rec-1", "hello", &metadata()).await.unwrap();
        }

        let sink = JsonlReportSink::create(&path).await.unwrap();
        let output_ref = sink.write("rec-2", "again", &metadata()).await.unwrap();
        assert!(output_ref.ends_with(":2"));
    }
}
