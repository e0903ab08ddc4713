//! Demo driving the callscribe engine end to end with in-memory collaborators
//!
//! This example demonstrates:
//! - Wiring a call log source, blob fetcher, transcription backend and
//!   report sink into the scheduler
//! - Quota-aware spreading of a small batch over two credentials
//! - The run summary and per-credential usage report
//!
//! To run: cargo run --example demo

use anyhow::Result;
use async_trait::async_trait;
use callscribe::{
    checkpoint::CheckpointStore,
    config::RunConfig,
    credentials::{CredentialLease, CredentialSpec},
    pipeline::{BlobFetcher, CallLogSource, ReportSink, TranscriptionBackend},
    protocol::{RecordingDescriptor, ReportMetadata, StageError},
    scheduler::Scheduler,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;

/// Call log source over a fixed list of descriptors
struct DemoSource(VecDeque<RecordingDescriptor>);

#[async_trait]
impl CallLogSource for DemoSource {
    async fn next(&mut self) -> callscribe::Result<Option<RecordingDescriptor>> {
        Ok(self.0.pop_front())
    }
}

/// Fetcher that synthesizes a few bytes of "audio" per reference
struct DemoFetcher;

#[async_trait]
impl BlobFetcher for DemoFetcher {
    async fn fetch(&self, fetch_ref: &str) -> std::result::Result<Vec<u8>, StageError> {
        Ok(format!("audio for {fetch_ref}").into_bytes())
    }
}

/// Backend that "transcribes" by describing its input
struct DemoBackend;

#[async_trait]
impl TranscriptionBackend for DemoBackend {
    async fn transcribe(
        &self,
        audio: &[u8],
        credential: &CredentialLease,
    ) -> std::result::Result<String, StageError> {
        Ok(format!(
            "[{}] transcript of {} bytes",
            credential.id,
            audio.len()
        ))
    }
}

/// Sink that logs each transcript instead of persisting it
struct DemoSink;

#[async_trait]
impl ReportSink for DemoSink {
    async fn write(
        &self,
        job_id: &str,
        text: &str,
        metadata: &ReportMetadata,
    ) -> callscribe::Result<String> {
        info!(
            "Transcript for {} via {}: {}",
            job_id, metadata.credential_id, text
        );
        Ok(format!("demo:{job_id}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Callscribe Demo Starting");

    let credential = |id: &str| CredentialSpec {
        id: id.to_string(),
        secret: format!("demo-secret-{id}"),
        secret_env: None,
        requests_per_minute: 30.0,
        audio_seconds_per_hour: 7200.0,
    };
    let config = RunConfig {
        credentials: vec![credential("key-1"), credential("key-2")],
        min_duration_seconds: 30.0,
        ..RunConfig::default()
    };

    let scheduler = Scheduler::new(
        config,
        CheckpointStore::new_temp()?,
        Arc::new(DemoFetcher),
        Arc::new(DemoBackend),
        Arc::new(DemoSink),
    )?;

    // Eight healthy recordings plus one below the minimum duration
    let mut descriptors: VecDeque<RecordingDescriptor> = (0..8)
        .map(|i| RecordingDescriptor::new(format!("call-{i}"), format!("call-{i}.mp3"), 90.0))
        .collect();
    descriptors.push_back(RecordingDescriptor::new("voicemail-blip", "blip.mp3", 4.0));

    let stats = scheduler
        .submit(&mut DemoSource(descriptors))
        .await?;
    info!(
        "Submitted: {} queued, {} skipped as too short",
        stats.queued, stats.skipped_short
    );

    let summary = scheduler.run().await?;

    info!("Summary: {}", summary);
    for usage in &summary.credential_usage {
        info!(
            "  {}: {} request(s), {:.0}s audio committed",
            usage.id, usage.requests, usage.audio_seconds
        );
    }

    info!("Demo completed successfully!");
    Ok(())
}
