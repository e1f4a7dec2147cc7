// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::batch::BatchLimits;
use crate::record::RecordKind;
use crate::transport::RetryStrategy;

const DEFAULT_MAX_BATCH_RECORDS: usize = 1_000;
const DEFAULT_MAX_BATCH_BYTES: usize = 1_024 * 1_024;
const DEFAULT_MAX_RECORD_BYTES: usize = 256 * 1_024;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRY_ATTEMPTS: u64 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_MAX_WORKERS: usize = 5;
const DEFAULT_LOCK_STALE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 0;

/// Upper bound for every configured interval and timeout. Deadlines are
/// computed as `now + interval`, which must stay representable.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while building or validating a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Unable to determine a cache directory: set RUN_TELEMETRY_CACHE_DIR")]
    NoCacheDir,
}

/// Client configuration shared by the dispatcher and the sender.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the tracking service, e.g. `https://tracking.example.com`
    pub server_url: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Root of the offline cache
    pub cache_dir: PathBuf,
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub max_batch_records: usize,
    pub max_batch_bytes: usize,
    /// Largest single record the dispatcher accepts, in bytes
    pub max_record_bytes: usize,
    /// Maximum time a record waits in the dispatcher before it is flushed
    pub flush_interval: Duration,
    /// Bound on records queued between producers and the dispatch task
    pub queue_capacity: usize,
    /// How long `enqueue` may block on a full queue
    pub enqueue_timeout: Duration,
    /// How long `shutdown` waits for delivery before spilling to the cache
    pub shutdown_timeout: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    pub retry_strategy: RetryStrategy,
    /// Number of runs the sender replays concurrently
    pub max_workers: usize,
    /// Age after which a lock file is reclaimed even if its pid is alive
    pub lock_stale_after: Duration,
    /// Minimum time between heartbeats sent by an online dispatcher
    pub heartbeat_interval: Duration,
    /// Whether the sender retries runs carrying a failed-replay marker
    pub retry_failed: bool,
    /// Cap on online submissions per second from one dispatcher; 0 disables it
    pub max_requests_per_second: u32,
    /// Record kinds the sender replays; `None` replays every kind
    pub replay_kinds: Option<Vec<RecordKind>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            token: None,
            cache_dir: env::temp_dir().join("run-telemetry").join("cache"),
            https_proxy: None,
            log_level: "info".to_string(),
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: Duration::from_millis(DEFAULT_ENQUEUE_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: DEFAULT_RETRY_ATTEMPTS,
                base_ms: DEFAULT_RETRY_BACKOFF_MS,
                max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
            },
            max_workers: DEFAULT_MAX_WORKERS,
            lock_stale_after: Duration::from_secs(DEFAULT_LOCK_STALE_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            retry_failed: false,
            max_requests_per_second: DEFAULT_MAX_REQUESTS_PER_SECOND,
            replay_kinds: None,
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = env::var("RUN_TELEMETRY_URL").unwrap_or(defaults.server_url);
        let token = env::var("RUN_TELEMETRY_TOKEN").ok().filter(|t| !t.is_empty());
        let cache_dir = match env::var("RUN_TELEMETRY_CACHE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => env::var("HOME")
                .map(|home| PathBuf::from(home).join(".run-telemetry").join("cache"))
                .map_err(|_| ConfigError::NoCacheDir)?,
        };
        let https_proxy = env::var("RUN_TELEMETRY_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let log_level = env::var("RUN_TELEMETRY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let retry_attempts = parse_var("RUN_TELEMETRY_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?;
        let retry_backoff_ms =
            parse_var("RUN_TELEMETRY_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?;
        let retry_backoff_max_ms = parse_var(
            "RUN_TELEMETRY_RETRY_BACKOFF_MAX_MS",
            DEFAULT_RETRY_BACKOFF_MAX_MS,
        )?;

        let config = Self {
            server_url,
            token,
            cache_dir,
            https_proxy,
            log_level,
            max_batch_records: parse_var(
                "RUN_TELEMETRY_MAX_BATCH_RECORDS",
                DEFAULT_MAX_BATCH_RECORDS,
            )?,
            max_batch_bytes: parse_var("RUN_TELEMETRY_MAX_BATCH_BYTES", DEFAULT_MAX_BATCH_BYTES)?,
            max_record_bytes: parse_var(
                "RUN_TELEMETRY_MAX_RECORD_BYTES",
                DEFAULT_MAX_RECORD_BYTES,
            )?,
            flush_interval: Duration::from_millis(parse_var(
                "RUN_TELEMETRY_FLUSH_INTERVAL_MS",
                DEFAULT_FLUSH_INTERVAL_MS,
            )?),
            queue_capacity: parse_var("RUN_TELEMETRY_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            enqueue_timeout: Duration::from_millis(parse_var(
                "RUN_TELEMETRY_ENQUEUE_TIMEOUT_MS",
                DEFAULT_ENQUEUE_TIMEOUT_MS,
            )?),
            shutdown_timeout: Duration::from_millis(parse_var(
                "RUN_TELEMETRY_SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            )?),
            request_timeout: Duration::from_secs(parse_var(
                "RUN_TELEMETRY_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: retry_attempts,
                base_ms: retry_backoff_ms,
                max_ms: retry_backoff_max_ms,
            },
            max_workers: parse_var("RUN_TELEMETRY_MAX_WORKERS", DEFAULT_MAX_WORKERS)?,
            lock_stale_after: Duration::from_secs(parse_var(
                "RUN_TELEMETRY_LOCK_STALE_SECS",
                DEFAULT_LOCK_STALE_SECS,
            )?),
            heartbeat_interval: Duration::from_secs(parse_var(
                "RUN_TELEMETRY_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?),
            retry_failed: env::var("RUN_TELEMETRY_RETRY_FAILED")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(false),
            max_requests_per_second: parse_var(
                "RUN_TELEMETRY_MAX_REQUESTS_PER_SECOND",
                DEFAULT_MAX_REQUESTS_PER_SECOND,
            )?,
            replay_kinds: match env::var("RUN_TELEMETRY_REPLAY_KINDS") {
                Ok(value) => Some(parse_kinds(&value).ok_or(ConfigError::InvalidValue {
                    name: "RUN_TELEMETRY_REPLAY_KINDS",
                    value,
                })?),
                Err(_) => None,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if reqwest::Url::parse(&self.server_url).is_err() {
            return Err(ConfigError::InvalidValue {
                name: "RUN_TELEMETRY_URL",
                value: self.server_url.clone(),
            });
        }

        if self.max_batch_records == 0 || self.max_batch_bytes == 0 || self.max_record_bytes == 0
        {
            return Err(ConfigError::Invalid(
                "batch and record limits must be greater than 0".to_string(),
            ));
        }

        if self.max_record_bytes > self.max_batch_bytes {
            return Err(ConfigError::Invalid(format!(
                "max record size ({}) exceeds max batch size ({})",
                self.max_record_bytes, self.max_batch_bytes
            )));
        }

        if self.queue_capacity == 0 || self.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity and worker count must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush and heartbeat intervals must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("flush interval", self.flush_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("enqueue timeout", self.enqueue_timeout),
            ("shutdown timeout", self.shutdown_timeout),
            ("request timeout", self.request_timeout),
            ("lock stale age", self.lock_stale_after),
        ] {
            if value > MAX_INTERVAL {
                return Err(ConfigError::Invalid(format!(
                    "{name} of {value:?} exceeds the maximum of {MAX_INTERVAL:?}"
                )));
            }
        }

        if self.replay_kinds.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::Invalid(
                "replay kinds must name at least one record kind".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_records: self.max_batch_records,
            max_bytes: self.max_batch_bytes,
        }
    }

    /// Whether the sender replays records of `kind`.
    #[must_use]
    pub fn replays(&self, kind: RecordKind) -> bool {
        self.replay_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Parses a comma-separated kind list such as `metric,event`.
fn parse_kinds(value: &str) -> Option<Vec<RecordKind>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(|kind| kind.parse().ok())
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 10] = [
        "RUN_TELEMETRY_URL",
        "RUN_TELEMETRY_TOKEN",
        "RUN_TELEMETRY_CACHE_DIR",
        "RUN_TELEMETRY_LOG_LEVEL",
        "RUN_TELEMETRY_MAX_BATCH_RECORDS",
        "RUN_TELEMETRY_FLUSH_INTERVAL_MS",
        "RUN_TELEMETRY_RETRY_ATTEMPTS",
        "RUN_TELEMETRY_RETRY_FAILED",
        "RUN_TELEMETRY_MAX_REQUESTS_PER_SECOND",
        "RUN_TELEMETRY_REPLAY_KINDS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = Config {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level 'verbose'"));
    }

    #[test]
    fn test_validate_record_larger_than_batch() {
        let config = Config {
            max_record_bytes: 2_048,
            max_batch_bytes: 1_024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_limits() {
        let config = Config {
            max_batch_records: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_intervals() {
        let config = Config {
            heartbeat_interval: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat interval"));

        for config in [
            Config {
                shutdown_timeout: Duration::MAX,
                ..Default::default()
            },
            Config {
                flush_interval: MAX_INTERVAL + Duration::from_millis(1),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }

        let config = Config {
            lock_stale_after: MAX_INTERVAL,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replay_kinds_filter() {
        let config = Config::default();
        assert!(config.replays(RecordKind::Alert));

        let config = Config {
            replay_kinds: Some(vec![RecordKind::Metric, RecordKind::Event]),
            ..Default::default()
        };
        assert!(config.replays(RecordKind::Metric));
        assert!(!config.replays(RecordKind::Artifact));

        let config = Config {
            replay_kinds: Some(Vec::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_url() {
        let config = Config {
            server_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                name: "RUN_TELEMETRY_URL",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        clear_env();
        env::set_var("RUN_TELEMETRY_URL", "https://tracking.example.com");
        env::set_var("RUN_TELEMETRY_TOKEN", "secret");
        env::set_var("RUN_TELEMETRY_CACHE_DIR", "/tmp/rt-cache");
        env::set_var("RUN_TELEMETRY_LOG_LEVEL", "DEBUG");
        env::set_var("RUN_TELEMETRY_MAX_BATCH_RECORDS", "50");
        env::set_var("RUN_TELEMETRY_FLUSH_INTERVAL_MS", "250");
        env::set_var("RUN_TELEMETRY_RETRY_ATTEMPTS", "2");
        env::set_var("RUN_TELEMETRY_RETRY_FAILED", "true");
        env::set_var("RUN_TELEMETRY_MAX_REQUESTS_PER_SECOND", "4");
        env::set_var("RUN_TELEMETRY_REPLAY_KINDS", "metric, alert");

        let config = Config::from_env().expect("config should load");
        assert_eq!(config.server_url, "https://tracking.example.com");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/rt-cache"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_batch_records, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.retry_strategy.max_attempts(), 2);
        assert!(config.retry_failed);
        assert_eq!(config.max_requests_per_second, 4);
        assert_eq!(
            config.replay_kinds,
            Some(vec![RecordKind::Metric, RecordKind::Alert])
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unparseable_number() {
        clear_env();
        env::set_var("RUN_TELEMETRY_CACHE_DIR", "/tmp/rt-cache");
        env::set_var("RUN_TELEMETRY_MAX_BATCH_RECORDS", "lots");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "RUN_TELEMETRY_MAX_BATCH_RECORDS",
                ..
            }
        ));

        clear_env();
        env::set_var("RUN_TELEMETRY_CACHE_DIR", "/tmp/rt-cache");
        env::set_var("RUN_TELEMETRY_REPLAY_KINDS", "metric,logs");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue {
                name: "RUN_TELEMETRY_REPLAY_KINDS",
                ..
            })
        ));
        clear_env();
    }
}
