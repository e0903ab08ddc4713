use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::protocol::{CheckpointRecord, JobState};
use crate::{CallscribeError, Result};

/// Durable store of terminal job outcomes, keyed by job id
///
/// Records are last-write-wins per id and flushed to disk before `record`
/// returns, so a crash between "transcription succeeded" and "checkpoint
/// written" can only ever cause a safe re-attempt, never silent loss.
#[derive(Clone)]
pub struct CheckpointStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(&path).with_context(|| {
            format!(
                "failed to open checkpoint store at {}",
                path.as_ref().display()
            )
        })?;
        let tree = db
            .open_tree("checkpoints")
            .context("failed to open checkpoint tree")?;

        info!(
            "Opened checkpoint store at {} ({} records)",
            path.as_ref().display(),
            tree.len()
        );
        Ok(Self { db, tree })
    }

    /// Create an in-memory store (useful for testing and demos)
    pub fn new_temp() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to create temporary checkpoint store")?;
        let tree = db
            .open_tree("checkpoints")
            .context("failed to open checkpoint tree")?;
        Ok(Self { db, tree })
    }

    /// Persist a terminal outcome and flush before returning
    pub async fn record(&self, record: &CheckpointRecord) -> Result<()> {
        if !record.final_state.is_terminal() {
            return Err(CallscribeError::Checkpoint(format!(
                "refusing to checkpoint non-terminal state {} for job {}",
                record.final_state, record.job_id
            )));
        }

        let bytes = record.to_bytes()?;
        self.tree.insert(record.job_id.as_bytes(), bytes)?;
        self.db.flush_async().await?;

        debug!("Checkpointed job {} as {}", record.job_id, record.final_state);
        Ok(())
    }

    /// Whether any record exists for this job id
    pub fn has(&self, job_id: &str) -> Result<bool> {
        Ok(self.tree.contains_key(job_id.as_bytes())?)
    }

    /// Fetch the authoritative record for a job id
    pub fn get(&self, job_id: &str) -> Result<Option<CheckpointRecord>> {
        match self.tree.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(CheckpointRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids that must not be re-dispatched on resume
    ///
    /// Done and Skipped are always filtered; Failed is filtered unless
    /// `retry_failed` opts exhausted jobs back in.
    pub fn load_terminal(&self, retry_failed: bool) -> Result<HashSet<String>> {
        let mut terminal = HashSet::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let record = CheckpointRecord::from_bytes(&bytes)?;
            let resumable_failure = retry_failed && record.final_state == JobState::Failed;
            if record.final_state.is_terminal() && !resumable_failure {
                terminal.insert(record.job_id);
            }
        }
        Ok(terminal)
    }

    /// Fold the store into per-state totals
    pub fn terminal_counts(&self) -> Result<HashMap<JobState, u64>> {
        let mut counts = HashMap::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let record = CheckpointRecord::from_bytes(&bytes)?;
            *counts.entry(record.final_state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Number of records in the store
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
