use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::credentials::CredentialSpec;
use crate::{CallscribeError, Result};

/// Run configuration
///
/// Deserializes from JSON with per-field defaults; only `credentials`
/// has no usable default. Validated before any job is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Credentials the pool schedules across
    pub credentials: Vec<CredentialSpec>,
    /// Fraction of each nominal provider limit actually used (never 1.0
    /// in practice, to leave retry headroom)
    pub safety_factor: f64,
    /// Recordings with a known duration below this are skipped outright
    pub min_duration_seconds: f64,
    /// Transient attempts per job before it is failed
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff
    pub backoff_base_seconds: f64,
    /// Upper bound on the retry backoff
    pub backoff_cap_seconds: f64,
    /// Credential exclusion period after a rate-limit rejection
    pub cooldown_seconds: f64,
    /// Consecutive rejections before a credential is excluded for the run
    pub max_consecutive_rejections: u32,
    /// Worker task count; 0 means auto (3x credential count, minimum 2)
    pub worker_count: usize,
    /// Fallback poll interval while parked waiting for a credential
    pub poll_interval_seconds: f64,
    /// Minimum interval between fetch starts across all workers; 0 disables
    pub fetch_min_interval_seconds: f64,
    /// Audio-seconds estimate used for quota admission when a descriptor's
    /// duration is unknown before fetch
    pub unknown_duration_estimate_seconds: f64,
    /// Re-attempt jobs whose checkpoint says Failed on a previous run
    pub retry_failed: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            safety_factor: 0.9,
            min_duration_seconds: 20.0,
            max_attempts: 3,
            backoff_base_seconds: 2.0,
            backoff_cap_seconds: 60.0,
            cooldown_seconds: 120.0,
            max_consecutive_rejections: 3,
            worker_count: 0,
            poll_interval_seconds: 2.0,
            fetch_min_interval_seconds: 0.5,
            unknown_duration_estimate_seconds: 60.0,
            retry_failed: false,
        }
    }
}

impl RunConfig {
    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            CallscribeError::Config(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            CallscribeError::Config(format!(
                "failed to parse config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(config)
    }

    /// Fill in credential secrets from the environment where `secret_env`
    /// names a variable and `secret` is empty
    pub fn resolve_secrets(&mut self) -> Result<()> {
        for spec in &mut self.credentials {
            if !spec.secret.is_empty() {
                continue;
            }
            if let Some(var) = &spec.secret_env {
                spec.secret = std::env::var(var).map_err(|_| {
                    CallscribeError::Config(format!(
                        "credential {}: environment variable {var} is not set",
                        spec.id
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Reject configurations that cannot run; these are the only errors
    /// that abort before dispatch
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(CallscribeError::Config(
                "no credentials configured".to_string(),
            ));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(CallscribeError::Config(format!(
                "safety_factor must be in (0, 1], got {}",
                self.safety_factor
            )));
        }
        if self.max_attempts == 0 {
            return Err(CallscribeError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_seconds <= 0.0 {
            return Err(CallscribeError::Config(
                "poll_interval_seconds must be positive".to_string(),
            ));
        }
        for field in [
            ("min_duration_seconds", self.min_duration_seconds),
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_cap_seconds", self.backoff_cap_seconds),
            ("cooldown_seconds", self.cooldown_seconds),
            ("fetch_min_interval_seconds", self.fetch_min_interval_seconds),
            (
                "unknown_duration_estimate_seconds",
                self.unknown_duration_estimate_seconds,
            ),
        ] {
            if !field.1.is_finite() || field.1 < 0.0 {
                return Err(CallscribeError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    field.0, field.1
                )));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.credentials {
            if spec.id.is_empty() {
                return Err(CallscribeError::Config(
                    "credential with empty id".to_string(),
                ));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(CallscribeError::Config(format!(
                    "duplicate credential id {}",
                    spec.id
                )));
            }
            if spec.requests_per_minute <= 0.0 || spec.audio_seconds_per_hour <= 0.0 {
                return Err(CallscribeError::Config(format!(
                    "credential {}: limits must be positive",
                    spec.id
                )));
            }
        }
        Ok(())
    }

    /// Resolved worker count (see `worker_count`)
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            (self.credentials.len() * 3).max(2)
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_seconds)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_cap_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(id: &str) -> CredentialSpec {
        CredentialSpec {
            id: id.to_string(),
            secret: "k".to_string(),
            secret_env: None,
            requests_per_minute: 60.0,
            audio_seconds_per_hour: 7200.0,
        }
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.safety_factor, 0.9);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.worker_count, 0);
        assert!(!config.retry_failed);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = RunConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        let config = RunConfig {
            credentials: vec![spec("a")],
            ..RunConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = RunConfig {
            credentials: vec![spec("a"), spec("a")],
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_safety_factor() {
        let config = RunConfig {
            credentials: vec![spec("a")],
            safety_factor: 1.3,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_worker_count_auto_scales() {
        let config = RunConfig {
            credentials: vec![spec("a"), spec("b")],
            ..RunConfig::default()
        };
        assert_eq!(config.effective_worker_count(), 6);

        let pinned = RunConfig {
            worker_count: 4,
            ..config
        };
        assert_eq!(pinned.effective_worker_count(), 4);
    }

    #[test]
    fn test_load_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "credentials": [
                    {"id": "key-1", "secret": "s1", "requests_per_minute": 30, "audio_seconds_per_hour": 7200}
                ],
                "safety_factor": 0.85,
                "worker_count": 8
            }"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.credentials.len(), 1);
        assert_eq!(config.safety_factor, 0.85);
        assert_eq!(config.worker_count, 8);
        // Unspecified fields fall back to defaults
        assert_eq!(config.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_secrets_from_env() {
        std::env::set_var("CALLSCRIBE_TEST_KEY", "from-env");
        let mut config = RunConfig {
            credentials: vec![CredentialSpec {
                id: "a".to_string(),
                secret: String::new(),
                secret_env: Some("CALLSCRIBE_TEST_KEY".to_string()),
                requests_per_minute: 60.0,
                audio_seconds_per_hour: 7200.0,
            }],
            ..RunConfig::default()
        };

        config.resolve_secrets().unwrap();
        assert_eq!(config.credentials[0].secret, "from-env");
    }

    #[test]
    fn test_resolve_secrets_missing_env_is_an_error() {
        let mut config = RunConfig {
            credentials: vec![CredentialSpec {
                id: "a".to_string(),
                secret: String::new(),
                secret_env: Some("CALLSCRIBE_DEFINITELY_UNSET".to_string()),
                requests_per_minute: 60.0,
                audio_seconds_per_hour: 7200.0,
            }],
            ..RunConfig::default()
        };
        assert!(config.resolve_secrets().is_err());
    }
}
