//! Dispatcher configuration.
//!
//! Defaults suit a single replica polling once per second. [`DispatcherConfig::from_env`]
//! overrides them from `OUTBOX_*` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use composable_outbox_runtime::DispatcherConfig;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // OUTBOX_BATCH_SIZE=100 OUTBOX_POLL_INTERVAL_MS=250 ...
//! let config = DispatcherConfig::from_env()?;
//!
//! // Or explicitly
//! let config = DispatcherConfig::default()
//!     .with_batch_size(100)
//!     .with_poll_interval(Duration::from_millis(250));
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidEnvVar {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

static NEXT_DISPATCHER: AtomicUsize = AtomicUsize::new(0);

/// Settings for one [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Claimant identity; must be unique among concurrently running dispatchers
    pub dispatcher_id: String,
    /// Messages claimed per poll
    pub batch_size: usize,
    /// Sleep between poll cycles
    pub poll_interval: Duration,
    /// Minimum age before a message is eligible, covering commit-visibility lag
    pub grace: Duration,
    /// How long a claim is held; renewed before each consumer invocation, so it
    /// must exceed the longest single invocation plus its ledger write
    pub lease: Duration,
    /// Messages of one batch processed concurrently
    pub max_concurrency: usize,
    /// Optional upper bound on a single handler invocation
    pub handler_timeout: Option<Duration>,
    /// Backoff for storage failures
    pub storage_retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatcher_id: format!(
                "dispatcher-{}-{}",
                std::process::id(),
                NEXT_DISPATCHER.fetch_add(1, Ordering::Relaxed)
            ),
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
            grace: Duration::ZERO,
            lease: Duration::from_secs(60),
            max_concurrency: 8,
            handler_timeout: None,
            storage_retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OUTBOX_DISPATCHER_ID` | `dispatcher_id` |
    /// | `OUTBOX_BATCH_SIZE` | `batch_size` |
    /// | `OUTBOX_POLL_INTERVAL_MS` | `poll_interval` |
    /// | `OUTBOX_GRACE_MS` | `grace` |
    /// | `OUTBOX_LEASE_SECS` | `lease` |
    /// | `OUTBOX_MAX_CONCURRENCY` | `max_concurrency` |
    /// | `OUTBOX_HANDLER_TIMEOUT_MS` | `handler_timeout` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is malformed or the result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = lookup("OUTBOX_DISPATCHER_ID") {
            config.dispatcher_id = id;
        }
        if let Some(size) = parse_var(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "OUTBOX_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "OUTBOX_GRACE_MS")? {
            config.grace = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "OUTBOX_LEASE_SECS")? {
            config.lease = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&lookup, "OUTBOX_MAX_CONCURRENCY")? {
            config.max_concurrency = n;
        }
        if let Some(ms) = parse_var(&lookup, "OUTBOX_HANDLER_TIMEOUT_MS")? {
            config.handler_timeout = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher_id.trim().is_empty() {
            return Err(ConfigError::Validation("dispatcher_id cannot be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be > 0".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Validation("max_concurrency must be > 0".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be > 0".to_string()));
        }
        if self.lease.is_zero() {
            return Err(ConfigError::Validation("lease must be > 0".to_string()));
        }
        if let Some(timeout) = self.handler_timeout {
            if timeout.is_zero() || timeout >= self.lease {
                return Err(ConfigError::Validation(
                    "handler_timeout must be > 0 and shorter than lease".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Set the dispatcher id.
    #[must_use]
    pub fn with_dispatcher_id(mut self, id: impl Into<String>) -> Self {
        self.dispatcher_id = id.into();
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the grace period.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the per-batch concurrency.
    #[must_use]
    pub const fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Bound each handler invocation.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Set the storage retry policy.
    #[must_use]
    pub fn with_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.storage_retry = policy;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnvVar {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn default_ids_are_unique_within_a_process() {
        let a = DispatcherConfig::default();
        let b = DispatcherConfig::default();
        assert_ne!(a.dispatcher_id, b.dispatcher_id);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = DispatcherConfig::from_lookup(lookup(&[
            ("OUTBOX_DISPATCHER_ID", "replica-a"),
            ("OUTBOX_BATCH_SIZE", "10"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_GRACE_MS", "500"),
            ("OUTBOX_LEASE_SECS", "30"),
            ("OUTBOX_MAX_CONCURRENCY", "2"),
            ("OUTBOX_HANDLER_TIMEOUT_MS", "5000"),
        ]))
        .unwrap();

        assert_eq!(config.dispatcher_id, "replica-a");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.grace, Duration::from_millis(500));
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn malformed_variables_are_reported() {
        let err = DispatcherConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { var: "OUTBOX_BATCH_SIZE", .. }));
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let zero_batch = DispatcherConfig::default().with_batch_size(0);
        assert!(matches!(zero_batch.validate(), Err(ConfigError::Validation(_))));

        let slow_handler = DispatcherConfig::default()
            .with_lease(Duration::from_secs(10))
            .with_handler_timeout(Duration::from_secs(10));
        assert!(slow_handler.validate().is_err());
    }
}
