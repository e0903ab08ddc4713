use chrono::Utc;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::credentials::CredentialPool;
use crate::pipeline::{BlobFetcher, CallLogSource, ReportSink, TranscriptionBackend};
use crate::protocol::{
    CheckpointRecord, ErrorKind, Job, JobState, ReportMetadata, RunSummary,
};
use crate::Result;

pub mod backoff;

/// What `submit` did with the descriptors it drained
#[derive(Debug, Clone, Default)]
pub struct SubmitStats {
    /// Jobs placed on the pending queue
    pub queued: u64,
    /// Descriptors below the minimum duration, checkpointed Skipped
    pub skipped_short: u64,
    /// Descriptors already terminal in the checkpoint store
    pub already_terminal: u64,
    /// Descriptors whose id was already submitted this run
    pub duplicate: u64,
}

/// Schedules a batch of fetch-then-transcribe jobs across the credential
/// pool, checkpointing every terminal outcome
///
/// Collaborators are supplied as trait objects; the scheduler owns the
/// credential pool, the job queue and the run counters. `submit` drains
/// one or more sources, `run` drives everything to a terminal state.
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    seen: Mutex<HashSet<String>>,
    run_id: Uuid,
}

/// State shared between the scheduler and its worker tasks
struct Shared {
    config: RunConfig,
    pool: CredentialPool,
    checkpoint: CheckpointStore,
    fetcher: Arc<dyn BlobFetcher>,
    backend: Arc<dyn TranscriptionBackend>,
    sink: Arc<dyn ReportSink>,
    queue: JobQueue,
    counters: RunCounters,
    fetch_pacer: Option<FetchPacer>,
    cancelled: AtomicBool,
}

/// Clonable handle that requests a graceful stop: no new dispatch, prompt
/// abandonment of in-flight network calls, completed-stage writes finish
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the run to stop
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shared.cancelled.store(true, Ordering::Relaxed);
        let _ = self.tx.send(());
    }
}

impl Scheduler {
    /// Build a scheduler; configuration problems are the only errors that
    /// abort before any job is dispatched
    pub fn new(
        config: RunConfig,
        checkpoint: CheckpointStore,
        fetcher: Arc<dyn BlobFetcher>,
        backend: Arc<dyn TranscriptionBackend>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = CredentialPool::new(
            &config.credentials,
            config.safety_factor,
            config.cooldown(),
            config.max_consecutive_rejections,
            Instant::now(),
        )?;
        let fetch_pacer = if config.fetch_min_interval_seconds > 0.0 {
            Some(FetchPacer::new(Duration::from_secs_f64(
                config.fetch_min_interval_seconds,
            )))
        } else {
            None
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pool,
                checkpoint,
                fetcher,
                backend,
                sink,
                queue: JobQueue::new(),
                counters: RunCounters::default(),
                fetch_pacer,
                cancelled: AtomicBool::new(false),
            }),
            shutdown_tx,
            seen: Mutex::new(HashSet::new()),
            run_id: Uuid::new_v4(),
        })
    }

    /// Handle for requesting a graceful stop from outside the run
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Drain a call log source into the pending queue
    ///
    /// Ids already terminal in the checkpoint store are filtered out here,
    /// which is what makes a killed and restarted run resumable without
    /// reprocessing. Descriptors with a known duration below the minimum
    /// go straight to Skipped without ever being dispatched.
    pub async fn submit(&self, source: &mut dyn CallLogSource) -> Result<SubmitStats> {
        let mut stats = SubmitStats::default();

        while let Some(descriptor) = source.next().await? {
            if !self
                .seen
                .lock()
                .expect("submit dedupe lock poisoned")
                .insert(descriptor.id.clone())
            {
                stats.duplicate += 1;
                continue;
            }

            if let Some(record) = self.shared.checkpoint.get(&descriptor.id)? {
                let replayable =
                    self.shared.config.retry_failed && record.final_state == JobState::Failed;
                if record.final_state.is_terminal() && !replayable {
                    debug!(
                        "Skipping {}: already checkpointed as {}",
                        descriptor.id, record.final_state
                    );
                    stats.already_terminal += 1;
                    continue;
                }
            }

            let duration = descriptor.estimated_duration_seconds;
            if duration > 0.0 && duration < self.shared.config.min_duration_seconds {
                debug!(
                    "Skipping {}: {:.0}s is below the {:.0}s minimum",
                    descriptor.id, duration, self.shared.config.min_duration_seconds
                );
                self.shared
                    .checkpoint
                    .record(&CheckpointRecord::new(
                        descriptor.id.clone(),
                        JobState::Skipped,
                        None,
                    ))
                    .await?;
                self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                stats.skipped_short += 1;
                continue;
            }

            self.shared.queue.push(Job::from_descriptor(descriptor));
            stats.queued += 1;
        }

        info!(
            "Submitted {} job(s) ({} skipped short, {} already checkpointed, {} duplicates)",
            stats.queued, stats.skipped_short, stats.already_terminal, stats.duplicate
        );
        Ok(stats)
    }

    /// Drive every queued job to a terminal state and summarize the run
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let worker_count = self.shared.config.effective_worker_count();
        info!(
            "Starting run {} with {} worker(s) over {} credential(s)",
            self.run_id,
            worker_count,
            self.shared.pool.len()
        );

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                index,
                self.shutdown_tx.subscribe(),
            )));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut summary = self.shared.counters.snapshot();
        summary.run_id = self.run_id.to_string();
        summary.duration_seconds = started.elapsed().as_secs_f64();
        summary.credential_usage = self.shared.pool.usage_report();

        info!("Run complete: {}", summary);
        Ok(summary)
    }
}

/// Terminal-outcome counters for the in-progress run
#[derive(Default)]
struct RunCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    failures_by_kind: Mutex<HashMap<ErrorKind, u64>>,
}

impl RunCounters {
    fn record_failure(&self, kind: ErrorKind) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self
            .failures_by_kind
            .lock()
            .expect("failure counter lock poisoned")
            .entry(kind)
            .or_insert(0) += 1;
    }

    fn snapshot(&self) -> RunSummary {
        RunSummary {
            run_id: String::new(),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duration_seconds: 0.0,
            failures_by_kind: self
                .failures_by_kind
                .lock()
                .expect("failure counter lock poisoned")
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            credential_usage: Vec::new(),
        }
    }
}

/// Shared minimum-interval limiter for fetch starts
///
/// Each caller reserves the next free slot under the lock, then sleeps
/// until its slot outside the lock.
struct FetchPacer {
    next_slot: Mutex<Instant>,
    interval: Duration,
}

impl FetchPacer {
    fn new(interval: Duration) -> Self {
        Self {
            next_slot: Mutex::new(Instant::now()),
            interval,
        }
    }

    async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().expect("fetch pacer lock poisoned");
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        sleep_until(slot).await;
    }
}

/// A job parked until its backoff delay elapses
struct DelayedJob {
    ready_at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    // Reversed so the BinaryHeap yields the earliest ready_at first
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Job>,
    delayed: BinaryHeap<DelayedJob>,
    in_flight: usize,
    seq: u64,
}

enum Popped {
    Job(Job),
    Drained,
    Wait(Option<Duration>),
}

/// Shared pending queue: a ready deque plus a delay heap for backoff
/// requeues, with drain detection across in-flight jobs
struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, job: Job) {
        {
            let mut inner = self.lock();
            inner.ready.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Return a popped job to the queue after a delay, keeping the
    /// in-flight count balanced
    fn requeue(&self, job: Job, ready_at: Instant) {
        {
            let mut inner = self.lock();
            inner.in_flight -= 1;
            let seq = inner.seq;
            inner.seq += 1;
            inner.delayed.push(DelayedJob { ready_at, seq, job });
        }
        self.notify.notify_one();
    }

    /// Mark a popped job terminal; wakes all waiters once the queue drains
    fn finish(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.in_flight -= 1;
            inner.ready.is_empty() && inner.delayed.is_empty() && inner.in_flight == 0
        };
        if drained {
            self.notify.notify_waiters();
        }
    }

    fn try_pop(&self, now: Instant) -> Popped {
        let mut inner = self.lock();

        // Promote delayed jobs whose backoff has elapsed
        loop {
            match inner.delayed.peek() {
                Some(head) if head.ready_at <= now => {
                    if let Some(due) = inner.delayed.pop() {
                        inner.ready.push_back(due.job);
                    }
                }
                _ => break,
            }
        }

        if let Some(job) = inner.ready.pop_front() {
            inner.in_flight += 1;
            return Popped::Job(job);
        }
        if inner.in_flight == 0 && inner.delayed.is_empty() {
            return Popped::Drained;
        }
        Popped::Wait(
            inner
                .delayed
                .peek()
                .map(|d| d.ready_at.saturating_duration_since(now)),
        )
    }

    /// Next ready job, or None once the queue has fully drained. Sleeps
    /// are bounded by the next known due time with the poll interval as a
    /// safety net.
    async fn next(&self, poll: Duration) -> Option<Job> {
        loop {
            match self.try_pop(Instant::now()) {
                Popped::Job(job) => return Some(job),
                Popped::Drained => {
                    self.notify.notify_waiters();
                    return None;
                }
                Popped::Wait(due) => {
                    let bound = due
                        .unwrap_or(poll)
                        .min(poll)
                        .max(Duration::from_millis(1));
                    let _ = timeout(bound, self.notify.notified()).await;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("job queue lock poisoned")
    }
}

/// Marker for a worker interrupted by shutdown mid-job
struct Cancelled;

async fn worker_loop(shared: Arc<Shared>, index: usize, mut shutdown_rx: broadcast::Receiver<()>) {
    debug!("Worker {} started", index);
    loop {
        if shared.cancelled.load(Ordering::Relaxed) {
            break;
        }
        let job = tokio::select! {
            _ = shutdown_rx.recv() => break,
            job = shared.queue.next(shared.config.poll_interval()) => match job {
                Some(job) => job,
                None => break,
            },
        };
        if process_job(&shared, &mut shutdown_rx, job).await.is_err() {
            break;
        }
    }
    debug!("Worker {} stopped", index);
}

/// Drive one job through fetch and transcribe to a terminal state or a
/// requeue. Stage errors never propagate past this function.
async fn process_job(
    shared: &Shared,
    shutdown_rx: &mut broadcast::Receiver<()>,
    mut job: Job,
) -> std::result::Result<(), Cancelled> {
    // Fetch stage; audio survives a requeue, so retries skip straight to
    // transcription
    if job.audio.is_none() {
        job.state = JobState::Fetching;
        if let Some(pacer) = &shared.fetch_pacer {
            tokio::select! {
                _ = shutdown_rx.recv() => return Err(Cancelled),
                _ = pacer.wait() => {}
            }
        }
        let fetched = tokio::select! {
            biased;
            result = shared.fetcher.fetch(&job.fetch_ref) => result,
            _ = shutdown_rx.recv() => return Err(Cancelled),
        };
        match fetched {
            Ok(bytes) => {
                debug!("Job {} fetched {} bytes", job.id, bytes.len());
                job.audio = Some(bytes);
                job.state = JobState::Fetched;
            }
            Err(err) => {
                job.last_error = Some(err.to_string());
                return match err.kind {
                    // The fetch side has no pooled credential to cool
                    // down; rate limits there retry like any transient
                    ErrorKind::Transient | ErrorKind::RateLimited => {
                        retry_or_fail(shared, job, ErrorKind::Transient).await
                    }
                    other => fail_job(shared, job, other).await,
                };
            }
        }
    }

    let estimated = if job.estimated_duration_seconds > 0.0 {
        job.estimated_duration_seconds
    } else {
        shared.config.unknown_duration_estimate_seconds
    };

    // A job no credential could ever admit would otherwise park forever
    if shared.pool.live_count() > 0 && estimated >= shared.pool.max_audio_ceiling() {
        job.last_error = Some(format!(
            "estimated {estimated:.0}s of audio exceeds every credential's ceiling"
        ));
        return fail_job(shared, job, ErrorKind::InvalidInput).await;
    }

    job.state = JobState::Transcribing;
    loop {
        if shared.pool.live_count() == 0 {
            job.last_error = Some("no usable credentials remain".to_string());
            return fail_job(shared, job, ErrorKind::AuthFailure).await;
        }

        let now = Instant::now();
        let Some(lease) = shared.pool.acquire(estimated, now) else {
            // Parked: bounded wait until the earliest cooldown expiry or
            // window rollover, with the poll interval as a safety net
            let poll = shared.config.poll_interval();
            let wait = shared
                .pool
                .next_eligible_in(now)
                .map(|horizon| horizon.min(poll))
                .unwrap_or(poll);
            tokio::select! {
                _ = shutdown_rx.recv() => return Err(Cancelled),
                _ = sleep(wait.max(Duration::from_millis(1))) => {}
            }
            continue;
        };

        debug!("Job {} transcribing on credential {}", job.id, lease.id);
        let audio = job.audio.as_deref().unwrap_or_default();
        let outcome = tokio::select! {
            biased;
            result = shared.backend.transcribe(audio, &lease) => result,
            _ = shutdown_rx.recv() => return Err(Cancelled),
        };

        match outcome {
            Ok(text) => {
                shared.pool.record_success(&lease.id);
                let metadata = ReportMetadata {
                    duration_seconds: estimated,
                    credential_id: lease.id.clone(),
                    attempt_count: job.attempt_count,
                    completed_at: Utc::now(),
                    extra: job.metadata.clone(),
                };
                // The stage is complete: sink and checkpoint writes run to
                // completion even if shutdown arrives now
                match shared.sink.write(&job.id, &text, &metadata).await {
                    Ok(output_ref) => {
                        let record =
                            CheckpointRecord::new(job.id.clone(), JobState::Done, Some(output_ref));
                        if let Err(err) = shared.checkpoint.record(&record).await {
                            error!("Failed to checkpoint job {}: {}", job.id, err);
                            shared.counters.record_failure(ErrorKind::Fatal);
                            shared.queue.finish();
                            return Ok(());
                        }
                        shared.counters.processed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            "Job {} done on credential {} (attempt {})",
                            job.id,
                            lease.id,
                            job.attempt_count + 1
                        );
                        shared.queue.finish();
                        return Ok(());
                    }
                    Err(err) => {
                        warn!("Report sink failed for job {}: {}", job.id, err);
                        job.last_error = Some(format!("report sink: {err}"));
                        return retry_or_fail(shared, job, ErrorKind::Transient).await;
                    }
                }
            }
            Err(err) => match err.kind {
                ErrorKind::RateLimited => {
                    // The request did no real work; requeue uncounted and
                    // let the cooldown steer the next pick elsewhere
                    shared.pool.record_rejection(&lease.id, Instant::now());
                    debug!("Job {} rate limited on credential {}, repicking", job.id, lease.id);
                    continue;
                }
                ErrorKind::AuthFailure => {
                    shared.pool.record_auth_failure(&lease.id);
                    warn!(
                        "Job {} hit an auth failure on credential {}, repicking",
                        job.id, lease.id
                    );
                    continue;
                }
                ErrorKind::Transient => {
                    job.last_error = Some(err.to_string());
                    return retry_or_fail(shared, job, ErrorKind::Transient).await;
                }
                ErrorKind::InvalidInput | ErrorKind::Fatal => {
                    job.last_error = Some(err.to_string());
                    return fail_job(shared, job, err.kind).await;
                }
            },
        }
    }
}

/// Consume a transient attempt: requeue with exponential backoff, or fail
/// the job once attempts are exhausted
async fn retry_or_fail(
    shared: &Shared,
    mut job: Job,
    kind: ErrorKind,
) -> std::result::Result<(), Cancelled> {
    job.attempt_count += 1;
    if job.attempt_count >= shared.config.max_attempts {
        return fail_job(shared, job, kind).await;
    }

    let delay = backoff::with_jitter(
        backoff::delay_for_attempt(
            job.attempt_count,
            shared.config.backoff_base(),
            shared.config.backoff_cap(),
        ),
        &mut rand::thread_rng(),
    );
    warn!(
        "Job {} attempt {}/{} failed ({}), retrying in {:.1}s",
        job.id,
        job.attempt_count,
        shared.config.max_attempts,
        kind,
        delay.as_secs_f64()
    );
    shared.queue.requeue(job, Instant::now() + delay);
    Ok(())
}

/// Checkpoint a permanent failure; one job failing never blocks the batch
async fn fail_job(
    shared: &Shared,
    mut job: Job,
    kind: ErrorKind,
) -> std::result::Result<(), Cancelled> {
    job.state = JobState::Failed;
    error!(
        "Job {} failed permanently ({}, {} attempt(s)): {}",
        job.id,
        kind,
        job.attempt_count.max(1),
        job.last_error.as_deref().unwrap_or("unknown error")
    );

    let record = CheckpointRecord::new(job.id.clone(), JobState::Failed, None);
    if let Err(err) = shared.checkpoint.record(&record).await {
        error!("Failed to checkpoint job {}: {}", job.id, err);
    }
    shared.counters.record_failure(kind);
    shared.queue.finish();
    Ok(())
}
