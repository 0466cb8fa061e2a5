//! Configuration loading and representation.
//!
//! Every setting comes from the environment (a `.env` file is honored) and
//! has a default, so a bare `cargo run` starts against the in-memory store.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use jobforge_core::RetryPolicy;

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Queue runtime configuration shared by the API and worker processes.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Idle sleep between empty claim attempts.
    pub poll_interval: Duration,
    /// How long an `IN_PROGRESS` job may go without finishing before it is reclaimed.
    pub lease_duration: Duration,
    /// Minimum gap between two lease sweeps by the same worker.
    pub reclaim_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_exponent: u32,
    pub max_backoff: Option<Duration>,
    /// Applied to submissions that do not specify `max_attempts`.
    pub default_max_attempts: u32,
    /// Per-job execution timeout. Independent of `lease_duration`.
    pub execution_timeout: Option<Duration>,
    /// Sleep after a store error before the worker loop resumes.
    pub store_error_backoff: Duration,
    pub worker_concurrency: usize,
    /// Postgres URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            lease_duration: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1000),
            backoff_exponent: 2,
            max_backoff: None,
            default_max_attempts: 3,
            execution_timeout: None,
            store_error_backoff: Duration::from_millis(2000),
            worker_concurrency: 1,
            database_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl QueueConfig {
    /// Load `.env` (if present) and then read the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            poll_interval: millis(&get, "JOB_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            lease_duration: secs(&get, "JOB_LEASE_SECS")?.unwrap_or(defaults.lease_duration),
            reclaim_interval: secs(&get, "JOB_RECLAIM_INTERVAL_SECS")?
                .unwrap_or(defaults.reclaim_interval),
            backoff_base: millis(&get, "JOB_BACKOFF_BASE_MS")?.unwrap_or(defaults.backoff_base),
            backoff_exponent: parse(&get, "JOB_BACKOFF_EXPONENT")?
                .unwrap_or(defaults.backoff_exponent),
            max_backoff: secs(&get, "JOB_BACKOFF_MAX_SECS")?,
            default_max_attempts: parse(&get, "JOB_DEFAULT_MAX_ATTEMPTS")?
                .unwrap_or(defaults.default_max_attempts),
            execution_timeout: secs(&get, "JOB_EXECUTION_TIMEOUT_SECS")?,
            store_error_backoff: millis(&get, "JOB_STORE_ERROR_BACKOFF_MS")?
                .unwrap_or(defaults.store_error_backoff),
            worker_concurrency: parse(&get, "WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker_concurrency),
            database_url: get("DATABASE_URL"),
            bind_addr: parse(&get, "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_exponent == 0 {
            return Err(ConfigError::invalid("JOB_BACKOFF_EXPONENT", "0", "must be at least 1"));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "JOB_DEFAULT_MAX_ATTEMPTS",
                "0",
                "must be greater than zero",
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::invalid(
                "WORKER_CONCURRENCY",
                "0",
                "must be greater than zero",
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::invalid("JOB_LEASE_SECS", "0", "must be greater than zero"));
        }
        Ok(())
    }

    /// Backoff policy described by this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::exponential(self.backoff_base, self.backoff_exponent);
        match self.max_backoff {
            Some(max) => policy.with_max_delay(max),
            None => policy,
        }
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(var, raw.clone(), e.to_string()))
        })
        .transpose()
}

fn millis<G>(get: &G, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, G>(get, var)?.map(Duration::from_millis))
}

fn secs<G>(get: &G, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, G>(get, var)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.bind_addr.port(), 3000);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("JOB_POLL_INTERVAL_MS", "250"),
            ("JOB_LEASE_SECS", "60"),
            ("JOB_BACKOFF_BASE_MS", "500"),
            ("JOB_BACKOFF_EXPONENT", "3"),
            ("JOB_BACKOFF_MAX_SECS", "120"),
            ("JOB_DEFAULT_MAX_ATTEMPTS", "5"),
            ("JOB_EXECUTION_TIMEOUT_SECS", "30"),
            ("WORKER_CONCURRENCY", "4"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("BIND_ADDR", "127.0.0.1:8080"),
        ])
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());

        let policy = config.retry_policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(120));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("DATABASE_URL", ""), ("JOB_LEASE_SECS", "  ")]).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.lease_duration, Duration::from_secs(300));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config_from(&[("JOB_LEASE_SECS", "five")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_LEASE_SECS", .. }));

        let err = config_from(&[("JOB_DEFAULT_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_DEFAULT_MAX_ATTEMPTS", .. }));

        let err = config_from(&[("JOB_BACKOFF_EXPONENT", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_BACKOFF_EXPONENT", .. }));
    }
}
