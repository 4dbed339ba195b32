//! File configuration for a collection run.
//!
//! Every field has a default, so a missing file, an empty object, or a file
//! naming only a few settings are all valid. The loaded value is passed into
//! constructors explicitly; nothing here is global.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_MIN_SIZE_BYTES, PDF_MAGIC, READ_TIMEOUT_SECS,
};
use crate::download::{
    Backoff, ContentValidator, DEFAULT_MAX_ATTEMPTS, FailurePolicy, RetryPolicy,
};
use crate::orchestrator::{
    DEFAULT_CONCURRENCY, DEFAULT_ENDPOINT, MAX_CONCURRENCY, MIN_CONCURRENCY, OrchestratorConfig,
};
use crate::ratelimit::{IntervalLimiter, RateLimitConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`CollectorConfig`].
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Dotted field name.
        field: String,
        /// The rejected value.
        value: String,
        /// The accepted range.
        expected: &'static str,
    },

    /// The default endpoint has no rate-limit entry.
    #[error("default endpoint `{name}` has no entry in `rate_limits`")]
    MissingDefaultEndpoint {
        /// The configured default endpoint.
        name: String,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Worker pool and consumer tuning.
    pub orchestrator: OrchestratorSection,
    /// Per-item fetch behavior.
    pub fetch: FetchSection,
    /// Adaptive limits per endpoint name.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Locations on disk.
    pub paths: PathsSection,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSection::default(),
            fetch: FetchSection::default(),
            rate_limits: HashMap::from([(
                DEFAULT_ENDPOINT.to_string(),
                RateLimitConfig::default(),
            )]),
            paths: PathsSection::default(),
        }
    }
}

/// `orchestrator` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Worker pool size.
    pub concurrency: usize,
    /// Settled items between checkpoint saves.
    pub save_every: usize,
    /// Consumer queue poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Consumer join timeout in seconds.
    pub join_timeout_secs: u64,
    /// Message queue capacity.
    pub channel_capacity: usize,
    /// Endpoint for items that do not name one.
    pub default_endpoint: String,
    /// Treat unclassified errors as permanent.
    pub unknown_is_permanent: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            save_every: defaults.save_every,
            poll_interval_ms: 100,
            join_timeout_secs: 30,
            channel_capacity: defaults.channel_capacity,
            default_endpoint: DEFAULT_ENDPOINT.to_string(),
            unknown_is_permanent: false,
        }
    }
}

impl OrchestratorSection {
    /// Converts to the orchestrator's runtime settings.
    #[must_use]
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency,
            save_every: self.save_every,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            channel_capacity: self.channel_capacity,
            default_endpoint: self.default_endpoint.clone(),
        }
    }

    /// Returns the permanence policy for unclassified errors.
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            unknown_is_permanent: self.unknown_is_permanent,
        }
    }
}

/// `fetch` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    /// Total attempts per item, including the first.
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Delay growth between attempts.
    pub backoff: Backoff,
    /// Cap on the computed delay in milliseconds.
    pub max_delay_ms: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds.
    pub read_timeout_secs: u64,
    /// Smallest acceptable body in bytes.
    pub min_size_bytes: u64,
    /// Required leading bytes of the body, as text. Empty disables the check.
    pub expected_magic: String,
    /// Minimum spacing between attempts to one host in milliseconds.
    /// Zero disables host spacing.
    pub domain_interval_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 2_000,
            backoff: Backoff::Exponential,
            max_delay_ms: 60_000,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            min_size_bytes: DEFAULT_MIN_SIZE_BYTES,
            expected_magic: String::from_utf8_lossy(PDF_MAGIC).into_owned(),
            domain_interval_ms: 0,
        }
    }
}

impl FetchSection {
    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_delay_ms),
            self.backoff,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Returns the content validator.
    #[must_use]
    pub fn validator(&self) -> ContentValidator {
        ContentValidator::new(self.min_size_bytes, self.expected_magic.as_bytes())
    }

    /// Returns the per-host interval limiter.
    #[must_use]
    pub fn interval_limiter(&self) -> IntervalLimiter {
        if self.domain_interval_ms == 0 {
            IntervalLimiter::disabled()
        } else {
            IntervalLimiter::new(Duration::from_millis(self.domain_interval_ms))
        }
    }

    /// Returns `(connect, request)` timeouts.
    #[must_use]
    pub fn timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.read_timeout_secs),
        )
    }
}

/// `paths` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory for checkpoints, backups, and failure reports.
    pub state_dir: PathBuf,
    /// Checkpoint file name inside `state_dir`.
    pub checkpoint_file: String,
    /// Local storage tier root.
    pub local_dir: PathBuf,
    /// Optional directory-backed remote tier.
    pub remote_dir: Option<PathBuf>,
    /// Keep a `.backup` copy of each checkpoint.
    pub backups: bool,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            checkpoint_file: "download_checkpoint.json".to_string(),
            local_dir: PathBuf::from("papers"),
            remote_dir: None,
            backups: true,
        }
    }
}

impl CollectorConfig {
    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`], or any
    /// validation error.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Loads `path` when given, else the default location when a file
    /// exists there, else the defaults.
    ///
    /// # Errors
    ///
    /// Same as [`CollectorConfig::load_from_file`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first bad value and
    /// [`ConfigError::MissingDefaultEndpoint`] when the default endpoint is
    /// not configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orchestrator = &self.orchestrator;
        check_range(
            "orchestrator.concurrency",
            orchestrator.concurrency as u64,
            MIN_CONCURRENCY as u64..=MAX_CONCURRENCY as u64,
            "1..=100",
        )?;
        check_range(
            "orchestrator.save_every",
            orchestrator.save_every as u64,
            1..=100_000,
            "1..=100000",
        )?;
        check_range(
            "orchestrator.poll_interval_ms",
            orchestrator.poll_interval_ms,
            1..=10_000,
            "1..=10000",
        )?;
        check_range(
            "orchestrator.join_timeout_secs",
            orchestrator.join_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "orchestrator.channel_capacity",
            orchestrator.channel_capacity as u64,
            1..=1_000_000,
            "1..=1000000",
        )?;

        let fetch = &self.fetch;
        check_range("fetch.max_retries", u64::from(fetch.max_retries), 1..=20, "1..=20")?;
        check_range(
            "fetch.retry_delay_ms",
            fetch.retry_delay_ms,
            0..=300_000,
            "0..=300000",
        )?;
        check_range(
            "fetch.max_delay_ms",
            fetch.max_delay_ms,
            0..=3_600_000,
            "0..=3600000",
        )?;
        check_range(
            "fetch.connect_timeout_secs",
            fetch.connect_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "fetch.read_timeout_secs",
            fetch.read_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "fetch.domain_interval_ms",
            fetch.domain_interval_ms,
            0..=60_000,
            "0..=60000",
        )?;

        for (name, limits) in &self.rate_limits {
            check_range(
                &format!("rate_limits.{name}.window_capacity"),
                limits.window_capacity as u64,
                1..=u64::from(u32::MAX),
                "1..=4294967295",
            )?;
            check_range(
                &format!("rate_limits.{name}.window_secs"),
                limits.window_secs,
                1..=86_400,
                "1..=86400",
            )?;
            if limits.fast_latency_ms > limits.slow_latency_ms {
                return Err(ConfigError::OutOfRange {
                    field: format!("rate_limits.{name}.fast_latency_ms"),
                    value: limits.fast_latency_ms.to_string(),
                    expected: "at most slow_latency_ms",
                });
            }
        }

        if !self.rate_limits.contains_key(&orchestrator.default_endpoint) {
            return Err(ConfigError::MissingDefaultEndpoint {
                name: orchestrator.default_endpoint.clone(),
            });
        }
        Ok(())
    }

    /// Returns the checkpoint path.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.paths.state_dir.join(&self.paths.checkpoint_file)
    }
}

fn check_range(
    field: &str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        expected,
    })
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/collector/config.json`
/// 2. `$HOME/.config/collector/config.json`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("collector")
                .join("config.json"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("collector")
            .join("config.json"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_config(dir: &TempDir, raw: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, raw).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CollectorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch.expected_magic, "%PDF");
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("state").join("download_checkpoint.json")
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "orchestrator": { "concurrency": 4 },
                "fetch": { "backoff": "fixed", "retry_delay_ms": 500 },
                "rate_limits": {
                    "default": { "window_capacity": 5 },
                    "crossref": { "window_capacity": 50, "burst_allowance": 10 }
                }
            }"#,
        );

        let config = CollectorConfig::load_from_file(&path).unwrap();
        assert_eq!(config.orchestrator.concurrency, 4);
        assert_eq!(config.orchestrator.save_every, 10);
        assert_eq!(config.fetch.backoff, Backoff::Fixed);
        assert_eq!(
            config.fetch.retry_policy().delay_after(3),
            Duration::from_millis(500)
        );
        assert_eq!(config.rate_limits["default"].window_capacity, 5);
        assert_eq!(config.rate_limits["default"].window_secs, 300);
        assert_eq!(config.rate_limits["crossref"].burst_allowance, 10);
        assert!(config.paths.backups);
    }

    #[test]
    fn test_empty_object_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{}");
        let config = CollectorConfig::load_from_file(&path).unwrap();
        assert_eq!(config, CollectorConfig::default());
    }

    #[test]
    fn test_rejects_out_of_range_concurrency() {
        let mut config = CollectorConfig::default();
        config.orchestrator.concurrency = 101;
        let error = config.validate().unwrap_err();
        assert!(
            error.to_string().contains("orchestrator.concurrency"),
            "unexpected error: {error}"
        );
        assert!(error.to_string().contains("1..=100"));
    }

    #[test]
    fn test_rejects_missing_default_endpoint() {
        let mut config = CollectorConfig::default();
        config.orchestrator.default_endpoint = "arxiv".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDefaultEndpoint { name }) if name == "arxiv"
        ));
    }

    #[test]
    fn test_rejects_inverted_latency_thresholds() {
        let mut config = CollectorConfig::default();
        let limits = config.rate_limits.get_mut(DEFAULT_ENDPOINT).unwrap();
        limits.fast_latency_ms = 10_000;
        limits.slow_latency_ms = 1_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ not json");
        let error = CollectorConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
        assert!(error.to_string().contains("config.json"));
    }

    #[test]
    fn test_unknown_is_permanent_flows_into_policy() {
        let mut section = OrchestratorSection::default();
        assert!(!section.failure_policy().unknown_is_permanent);
        section.unknown_is_permanent = true;
        assert!(section.failure_policy().unknown_is_permanent);
    }
}
