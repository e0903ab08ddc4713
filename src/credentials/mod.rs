use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::CredentialUsage;

pub mod quota;

pub use quota::QuotaWindow;

/// Length of the request-count quota window
pub const REQUEST_WINDOW: Duration = Duration::from_secs(60);

/// Length of the audio-seconds quota window
pub const AUDIO_WINDOW: Duration = Duration::from_secs(3600);

/// One API credential and its nominal provider limits
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialSpec {
    /// Identifier used in logs, reports and pool bookkeeping
    pub id: String,
    /// Opaque secret handed to the transcription backend
    #[serde(default)]
    pub secret: String,
    /// Environment variable to read the secret from when `secret` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
    /// Nominal provider limit on requests per minute
    pub requests_per_minute: f64,
    /// Nominal provider limit on audio seconds per hour
    pub audio_seconds_per_hour: f64,
}

impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs and debug output
        f.debug_struct("CredentialSpec")
            .field("id", &self.id)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("audio_seconds_per_hour", &self.audio_seconds_per_hour)
            .finish()
    }
}

/// A committed usage reservation against one credential
///
/// Usage is already counted by the time a lease exists; the holder only
/// needs the identity and secret to place the transcription call.
#[derive(Clone)]
pub struct CredentialLease {
    /// Credential id the usage was committed against
    pub id: String,
    /// Secret to authenticate the transcription call with
    pub secret: String,
    /// Audio seconds committed for this lease
    pub audio_seconds: f64,
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("audio_seconds", &self.audio_seconds)
            .finish()
    }
}

/// Per-credential mutable state owned exclusively by the pool
struct CredentialState {
    spec: CredentialSpec,
    requests: QuotaWindow,
    audio: QuotaWindow,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    excluded: bool,
    total_requests: u64,
    total_audio_seconds: f64,
}

impl CredentialState {
    /// Whether this credential can take `estimated` more audio seconds now.
    /// Clears an elapsed cooldown as a side effect.
    fn eligible(&mut self, estimated: f64, now: Instant) -> bool {
        if self.excluded {
            return false;
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        self.requests.admits(1.0, now) && self.audio.admits(estimated, now)
    }
}

/// Pool of credentials with independent quota accounting
///
/// All mutation happens under one mutex guarding counter arithmetic only;
/// the lock is never held across an await point or a network call.
pub struct CredentialPool {
    inner: Mutex<Vec<CredentialState>>,
    cooldown: Duration,
    max_consecutive_rejections: u32,
}

impl CredentialPool {
    /// Build a pool from credential specs, applying the safety factor to
    /// both ceilings. Fails when no credentials are supplied or the safety
    /// factor falls outside (0, 1].
    pub fn new(
        specs: &[CredentialSpec],
        safety_factor: f64,
        cooldown: Duration,
        max_consecutive_rejections: u32,
        now: Instant,
    ) -> crate::Result<Self> {
        if specs.is_empty() {
            return Err(crate::CallscribeError::Config(
                "no credentials configured".to_string(),
            ));
        }
        if !(safety_factor > 0.0 && safety_factor <= 1.0) {
            return Err(crate::CallscribeError::Config(format!(
                "safety_factor must be in (0, 1], got {safety_factor}"
            )));
        }

        let states = specs
            .iter()
            .map(|spec| CredentialState {
                spec: spec.clone(),
                requests: QuotaWindow::new(
                    REQUEST_WINDOW,
                    spec.requests_per_minute * safety_factor,
                    now,
                ),
                audio: QuotaWindow::new(
                    AUDIO_WINDOW,
                    spec.audio_seconds_per_hour * safety_factor,
                    now,
                ),
                cooldown_until: None,
                consecutive_failures: 0,
                excluded: false,
                total_requests: 0,
                total_audio_seconds: 0.0,
            })
            .collect();

        Ok(Self {
            inner: Mutex::new(states),
            cooldown,
            max_consecutive_rejections,
        })
    }

    /// Read-only query: the credential `acquire` would pick right now,
    /// without committing any usage
    pub fn pick(&self, estimated_audio_seconds: f64, now: Instant) -> Option<String> {
        let mut states = self.lock();
        select_index(&mut states, estimated_audio_seconds, now)
            .map(|i| states[i].spec.id.clone())
    }

    /// Pick the eligible credential with the greatest remaining audio
    /// headroom (ties broken by lowest request count) and commit one
    /// request plus `estimated_audio_seconds` against it, atomically with
    /// respect to concurrent callers
    pub fn acquire(&self, estimated_audio_seconds: f64, now: Instant) -> Option<CredentialLease> {
        let mut states = self.lock();
        let index = select_index(&mut states, estimated_audio_seconds, now)?;
        let state = &mut states[index];

        state.requests.commit(1.0, now);
        state.audio.commit(estimated_audio_seconds, now);
        state.total_requests += 1;
        state.total_audio_seconds += estimated_audio_seconds;

        debug!(
            "Committed usage on {}: {:.0} request(s), {:.0}s audio in window",
            state.spec.id,
            state.requests.used(),
            state.audio.used()
        );

        Some(CredentialLease {
            id: state.spec.id.clone(),
            secret: state.spec.secret.clone(),
            audio_seconds: estimated_audio_seconds,
        })
    }

    /// Handle a rate-limit rejection: start the cooldown and extend the
    /// consecutive-failure streak. Returns true when the credential has
    /// just become permanently excluded for the run.
    pub fn record_rejection(&self, id: &str, now: Instant) -> bool {
        let mut states = self.lock();
        let Some(state) = states.iter_mut().find(|s| s.spec.id == id) else {
            return false;
        };

        state.cooldown_until = Some(now + self.cooldown);
        state.consecutive_failures += 1;
        warn!(
            "Rate limit rejection on credential {} ({} consecutive), cooling down for {:?}",
            id, state.consecutive_failures, self.cooldown
        );

        if !state.excluded && state.consecutive_failures >= self.max_consecutive_rejections {
            state.excluded = true;
            warn!(
                "Credential {} permanently excluded after {} consecutive rate-limit rejections",
                id, state.consecutive_failures
            );
            return true;
        }
        false
    }

    /// A successful call resets the credential's failure streak
    pub fn record_success(&self, id: &str) {
        let mut states = self.lock();
        if let Some(state) = states.iter_mut().find(|s| s.spec.id == id) {
            state.consecutive_failures = 0;
        }
    }

    /// Permanently exclude a credential whose authentication was rejected
    pub fn record_auth_failure(&self, id: &str) {
        let mut states = self.lock();
        if let Some(state) = states.iter_mut().find(|s| s.spec.id == id) {
            if !state.excluded {
                state.excluded = true;
                warn!("Credential {} excluded after authentication failure", id);
            }
        }
    }

    /// Number of credentials not permanently excluded
    pub fn live_count(&self) -> usize {
        self.lock().iter().filter(|s| !s.excluded).count()
    }

    /// Total number of credentials in the pool
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool holds no credentials at all
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Largest audio ceiling among live credentials; jobs estimated above
    /// this can never be admitted
    pub fn max_audio_ceiling(&self) -> f64 {
        self.lock()
            .iter()
            .filter(|s| !s.excluded)
            .map(|s| s.audio.ceiling())
            .fold(0.0, f64::max)
    }

    /// Shortest duration after which some currently-ineligible live
    /// credential could become eligible again (cooldown expiry or window
    /// rollover). None when every credential is permanently excluded.
    pub fn next_eligible_in(&self, now: Instant) -> Option<Duration> {
        let states = self.lock();
        states
            .iter()
            .filter(|s| !s.excluded)
            .map(|s| match s.cooldown_until {
                Some(until) if now < until => until.duration_since(now),
                _ => s
                    .requests
                    .until_reset(now)
                    .min(s.audio.until_reset(now)),
            })
            .min()
    }

    /// Lifetime usage totals per credential, for the run summary
    pub fn usage_report(&self) -> Vec<CredentialUsage> {
        self.lock()
            .iter()
            .map(|s| CredentialUsage {
                id: s.spec.id.clone(),
                requests: s.total_requests,
                audio_seconds: s.total_audio_seconds,
                excluded: s.excluded,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CredentialState>> {
        self.inner.lock().expect("credential pool lock poisoned")
    }
}

/// Selection policy: greatest remaining audio headroom, ties broken by
/// lowest request count in the current window
fn select_index(states: &mut [CredentialState], estimated: f64, now: Instant) -> Option<usize> {
    let mut best: Option<(usize, f64, f64)> = None;
    for (i, state) in states.iter_mut().enumerate() {
        if !state.eligible(estimated, now) {
            continue;
        }
        let headroom = state.audio.headroom(now);
        let requests = state.requests.used();
        let better = match best {
            None => true,
            Some((_, best_headroom, best_requests)) => {
                headroom > best_headroom
                    || (headroom == best_headroom && requests < best_requests)
            }
        };
        if better {
            best = Some((i, headroom, requests));
        }
    }
    best.map(|(i, _, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(id: &str, rpm: f64, audio: f64) -> CredentialSpec {
        CredentialSpec {
            id: id.to_string(),
            secret: format!("secret-{id}"),
            secret_env: None,
            requests_per_minute: rpm,
            audio_seconds_per_hour: audio,
        }
    }

    fn pool(specs: &[CredentialSpec], now: Instant) -> CredentialPool {
        CredentialPool::new(specs, 0.9, Duration::from_secs(120), 3, now).unwrap()
    }

    #[test]
    fn test_empty_pool_is_a_config_error() {
        let result = CredentialPool::new(&[], 0.9, Duration::from_secs(60), 3, Instant::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_safety_factor_is_a_config_error() {
        let specs = [spec("a", 60.0, 7200.0)];
        assert!(CredentialPool::new(&specs, 0.0, Duration::from_secs(60), 3, Instant::now()).is_err());
        assert!(CredentialPool::new(&specs, 1.5, Duration::from_secs(60), 3, Instant::now()).is_err());
    }

    #[test]
    fn test_acquire_prefers_greatest_audio_headroom() {
        let now = Instant::now();
        let p = pool(&[spec("small", 60.0, 1000.0), spec("large", 60.0, 7200.0)], now);

        let lease = p.acquire(60.0, now).unwrap();
        assert_eq!(lease.id, "large");
    }

    #[test]
    fn test_tie_broken_by_lowest_request_count() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0), spec("b", 60.0, 7200.0)], now);

        // Commit a request-only imbalance: acquire with zero audio keeps the
        // audio headrooms tied while request counts diverge.
        let first = p.acquire(0.0, now).unwrap();
        let second = p.acquire(0.0, now).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_pick_is_read_only() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);

        assert_eq!(p.pick(60.0, now).as_deref(), Some("a"));
        assert_eq!(p.pick(60.0, now).as_deref(), Some("a"));
        let usage = &p.usage_report()[0];
        assert_eq!(usage.requests, 0);
        assert_eq!(usage.audio_seconds, 0.0);
    }

    #[test]
    fn test_ceilings_are_never_exceeded() {
        let now = Instant::now();
        // Request ceiling 5 * 0.9 = 4.5, audio ceiling 600 * 0.9 = 540
        let p = pool(&[spec("a", 5.0, 600.0)], now);

        let mut granted = 0;
        while p.acquire(60.0, now).is_some() {
            granted += 1;
            assert!(granted <= 100, "pool granted unbounded leases");
        }

        let usage = &p.usage_report()[0];
        assert!(usage.requests as f64 <= 4.5);
        assert!(usage.audio_seconds <= 540.0);
        // 4 requests of 60s fit under both ceilings; the 5th would not
        assert_eq!(granted, 4);
    }

    #[test]
    fn test_oversized_estimate_is_never_admitted() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 600.0)], now);
        assert!(p.acquire(600.0, now).is_none());
        assert!(p.max_audio_ceiling() < 600.0);
    }

    #[test]
    fn test_rejection_starts_cooldown_and_expires() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);

        p.record_rejection("a", now);
        assert!(p.acquire(60.0, now).is_none());

        // Cooldown is 120s in the fixture
        let still_cooling = now + Duration::from_secs(119);
        assert!(p.acquire(60.0, still_cooling).is_none());

        let expired = now + Duration::from_secs(121);
        assert!(p.acquire(60.0, expired).is_some());
    }

    #[test]
    fn test_consecutive_rejections_exclude_permanently() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);

        assert!(!p.record_rejection("a", now));
        assert!(!p.record_rejection("a", now));
        assert!(p.record_rejection("a", now));
        assert_eq!(p.live_count(), 0);

        // Exclusion outlives any cooldown
        let much_later = now + Duration::from_secs(3600);
        assert!(p.acquire(60.0, much_later).is_none());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);

        p.record_rejection("a", now);
        p.record_rejection("a", now);
        p.record_success("a");

        let after_cooldown = now + Duration::from_secs(121);
        assert!(!p.record_rejection("a", after_cooldown));
        assert_eq!(p.live_count(), 1);
    }

    #[test]
    fn test_auth_failure_excludes_immediately() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0), spec("b", 60.0, 7200.0)], now);

        p.record_auth_failure("a");
        assert_eq!(p.live_count(), 1);
        let lease = p.acquire(60.0, now).unwrap();
        assert_eq!(lease.id, "b");
    }

    #[test]
    fn test_next_eligible_in_reports_cooldown_remaining() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);

        p.record_rejection("a", now);
        let wait = p.next_eligible_in(now).unwrap();
        assert_eq!(wait, Duration::from_secs(120));
    }

    #[test]
    fn test_next_eligible_in_none_when_all_excluded() {
        let now = Instant::now();
        let p = pool(&[spec("a", 60.0, 7200.0)], now);
        p.record_auth_failure("a");
        assert!(p.next_eligible_in(now).is_none());
    }

    #[test]
    fn test_window_rollover_restores_capacity() {
        let now = Instant::now();
        let p = pool(&[spec("a", 2.0, 7200.0)], now);

        // Request ceiling 1.8: one request fits, the second does not
        assert!(p.acquire(10.0, now).is_some());
        assert!(p.acquire(10.0, now).is_none());

        let next_minute = now + Duration::from_secs(61);
        assert!(p.acquire(10.0, next_minute).is_some());
    }

    #[test]
    fn test_concurrent_acquire_never_double_books() {
        let now = Instant::now();
        let p = Arc::new(pool(&[spec("a", 200.0, 100_000.0), spec("b", 200.0, 100_000.0)], now));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                let mut granted = 0u64;
                while p.acquire(30.0, now).is_some() {
                    granted += 1;
                }
                granted
            }));
        }

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let report = p.usage_report();
        let total: u64 = report.iter().map(|u| u.requests).sum();
        assert_eq!(granted, total);

        for usage in &report {
            // Ceiling 200 * 0.9 = 180 requests; strict admission stops at 180
            assert!(usage.requests as f64 <= 180.0, "{usage:?}");
            assert!(usage.audio_seconds <= 90_000.0);
        }
    }

    #[test]
    fn test_fairness_across_equal_credentials() {
        let now = Instant::now();
        let p = pool(
            &[
                spec("a", 100_000.0, 1_000_000.0),
                spec("b", 100_000.0, 1_000_000.0),
                spec("c", 100_000.0, 1_000_000.0),
            ],
            now,
        );

        for _ in 0..300 {
            assert!(p.acquire(60.0, now).is_some());
        }

        let report = p.usage_report();
        let mean = 300.0 / 3.0;
        for usage in &report {
            let deviation = (usage.requests as f64 - mean).abs() / mean;
            assert!(deviation <= 0.1, "unfair usage: {usage:?}");
        }
    }
}
