//! Cache configuration.
//!
//! Mirrors the options in the database-backed cache's external interface:
//! connection string, object namespacing, local tier sizing, TTL defaults,
//! pool sizing, listener reconnect policy and stale-read fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::error::{CacheError, Result};

static PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,30}$").expect("valid regex"));

/// Back-off schedule for the notification listener's reconnect loop.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound the delay is capped at after repeated failures.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

/// Cache client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection string. Required.
    pub dsn: String,

    /// Namespace woven into every database object name and the notification
    /// channel. Restricted to `[A-Za-z_][A-Za-z0-9_]{0,30}`.
    pub object_prefix: String,

    /// Notification channel name. Defaults to `"<object_prefix>_events"`.
    pub notify_channel: Option<String>,

    /// When true, the notification listener is not started; the local tier
    /// relies entirely on TTL for coherence.
    pub disable_notify: bool,

    /// Capacity of the local in-memory tier. `0` disables it entirely.
    pub local_max_entries: u64,

    /// Default TTL applied to `set`/`get` calls that don't specify one.
    /// `None` means no TTL.
    pub default_ttl: Option<Duration>,

    /// Connection pool capacity.
    pub pool_size: u32,

    /// Per-call deadline for gateway operations.
    pub gateway_timeout: Duration,

    /// Listener reconnect back-off schedule.
    pub listener_reconnect_backoff: BackoffConfig,

    /// When true, `get` may return a stale local entry if the backend is
    /// unavailable instead of propagating `BackendUnavailable`.
    pub serve_stale_on_error: bool,

    /// How often the local store's background reaper sweeps expired entries.
    pub reaper_interval: Duration,
}

impl Config {
    /// Start building a configuration from a required DSN.
    pub fn builder(dsn: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(dsn)
    }

    /// The channel actually used, resolving the `notify_channel` default.
    pub fn channel(&self) -> String {
        self.notify_channel
            .clone()
            .unwrap_or_else(|| format!("{}_events", self.object_prefix))
    }

    fn validate(&self) -> Result<()> {
        if self.dsn.trim().is_empty() {
            return Err(CacheError::ConfigError("dsn must not be empty".into()));
        }
        if !PREFIX_RE.is_match(&self.object_prefix) {
            return Err(CacheError::ConfigError(format!(
                "object_prefix {:?} does not match [A-Za-z_][A-Za-z0-9_]{{0,30}}",
                self.object_prefix
            )));
        }
        if self.pool_size == 0 {
            return Err(CacheError::ConfigError(
                "pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`], matching the teacher's `with_config`/`Default`
/// pattern but with constructor-time validation since an invalid `dsn` or
/// `object_prefix` should surface as `ConfigError` rather than fail silently.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    fn new(dsn: impl Into<String>) -> Self {
        Self {
            config: Config {
                dsn: dsn.into(),
                object_prefix: "cache".to_string(),
                notify_channel: None,
                disable_notify: false,
                local_max_entries: 10_000,
                default_ttl: None,
                pool_size: 10,
                gateway_timeout: Duration::from_secs(5),
                listener_reconnect_backoff: BackoffConfig::default(),
                serve_stale_on_error: false,
                reaper_interval: Duration::from_secs(30),
            },
        }
    }

    /// Set the object prefix namespacing database objects and the channel.
    pub fn object_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.object_prefix = prefix.into();
        self
    }

    /// Override the notification channel name.
    pub fn notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.config.notify_channel = Some(channel.into());
        self
    }

    /// Disable the notification listener. Only this spelling is recognized;
    /// the local tier then relies entirely on TTL for coherence.
    pub fn disable_notify(mut self, disable: bool) -> Self {
        self.config.disable_notify = disable;
        self
    }

    /// Set the local tier's entry capacity. `0` disables the local tier.
    pub fn local_max_entries(mut self, n: u64) -> Self {
        self.config.local_max_entries = n;
        self
    }

    /// Set the default TTL applied when callers don't specify one.
    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Set the connection pool capacity.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the per-call deadline for gateway operations.
    pub fn gateway_timeout(mut self, timeout: Duration) -> Self {
        self.config.gateway_timeout = timeout;
        self
    }

    /// Set the listener's reconnect back-off schedule.
    pub fn listener_reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.listener_reconnect_backoff = backoff;
        self
    }

    /// Enable serving a stale local entry when the backend is unavailable.
    pub fn serve_stale_on_error(mut self, enabled: bool) -> Self {
        self.config.serve_stale_on_error = enabled;
        self
    }

    /// Set the local store's reaper sweep interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Finish building, validating every field.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_is_accepted() {
        let config = Config::builder("postgres://localhost/db").build().unwrap();
        assert_eq!(config.object_prefix, "cache");
        assert_eq!(config.channel(), "cache_events");
    }

    #[test]
    fn empty_dsn_is_rejected() {
        let err = Config::builder("").build().unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
    }

    #[test]
    fn invalid_object_prefix_is_rejected() {
        let err = Config::builder("postgres://localhost/db")
            .object_prefix("has a space")
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let err = Config::builder("postgres://localhost/db")
            .pool_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
    }

    #[test]
    fn explicit_channel_overrides_default() {
        let config = Config::builder("postgres://localhost/db")
            .object_prefix("tenant_a")
            .notify_channel("custom_channel")
            .build()
            .unwrap();
        assert_eq!(config.channel(), "custom_channel");
    }
}
