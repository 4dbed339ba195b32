//! Per-endpoint admission control with health-based backoff.
//!
//! Each configured endpoint owns a [`RollingWindow`] of request timestamps,
//! a health multiplier, and a consecutive-failure counter behind its own lock.
//! There is no limiter-wide lock, so unrelated endpoints never contend.
//!
//! # Health multiplier
//!
//! The multiplier lives in `[HEALTH_HEALTHY, HEALTH_OFFLINE]`. It deflates the
//! effective window headroom and inflates computed waits:
//!
//! | Outcome                           | Step                     |
//! |-----------------------------------|--------------------------|
//! | success, latency <= fast band     | `x FAST_SUCCESS_FACTOR`  |
//! | success, latency <= slow threshold| `x NORMAL_SUCCESS_FACTOR`|
//! | success, latency > slow threshold | `x SLOW_RESPONSE_FACTOR` |
//! | failure                           | `x FAILURE_FACTOR`       |
//!
//! The result is clamped after every step.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use collector_core::ratelimit::{AdaptiveRateLimiter, RateLimitConfig};
//!
//! let mut configs = HashMap::new();
//! configs.insert("arxiv".to_string(), RateLimitConfig::default());
//! let limiter = AdaptiveRateLimiter::new(configs);
//!
//! assert!(limiter.can_proceed("arxiv", 1).unwrap());
//! limiter.record("arxiv", true, Duration::from_millis(120), 1).unwrap();
//! assert!(limiter.wait_time("unknown", 1).is_err());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::RollingWindow;

/// Multiplier for a fully healthy endpoint (lower bound).
pub const HEALTH_HEALTHY: f64 = 1.0;
/// Multiplier for a degraded endpoint.
pub const HEALTH_DEGRADED: f64 = 2.0;
/// Multiplier for an endpoint in critical condition.
pub const HEALTH_CRITICAL: f64 = 4.0;
/// Multiplier for an offline endpoint (upper bound).
pub const HEALTH_OFFLINE: f64 = 8.0;

/// Global ceiling on any computed wait.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

const FAST_SUCCESS_FACTOR: f64 = 0.8;
const NORMAL_SUCCESS_FACTOR: f64 = 0.95;
const SLOW_RESPONSE_FACTOR: f64 = 1.2;
const FAILURE_FACTOR: f64 = 1.5;

/// Each request beyond the first in a batch adds this much to the wait scale.
const BATCH_STEP: f64 = 0.1;
const MAX_BATCH_MULTIPLIER: f64 = 2.0;

/// Exponent cap for the failure backoff term; keeps the float math finite.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Error returned for endpoint names that were never configured.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The endpoint name is not part of the limiter configuration.
    #[error("unknown rate-limit endpoint: {name}")]
    UnknownEndpoint {
        /// The name that was looked up.
        name: String,
    },
}

/// Immutable per-endpoint limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed inside one window.
    pub window_capacity: usize,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Base delay for the failure backoff term, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap for the failure backoff term, in milliseconds.
    pub max_delay_ms: u64,
    /// Latency above which a successful response still degrades health.
    pub slow_latency_ms: u64,
    /// Latency at or below which a success counts as fast.
    pub fast_latency_ms: u64,
    /// Extra window capacity granted only while the endpoint is fully healthy.
    pub burst_allowance: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_capacity: 100,
            window_secs: 300,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            slow_latency_ms: 5_000,
            fast_latency_ms: 1_000,
            burst_allowance: 0,
        }
    }
}

impl RateLimitConfig {
    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Returns the base backoff delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Returns the backoff cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Coarse health label supplied by an external health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTier {
    /// Endpoint responds normally.
    Healthy,
    /// Endpoint is slow or intermittently failing.
    Degraded,
    /// Endpoint is mostly failing.
    Critical,
    /// Endpoint is unreachable.
    Offline,
}

impl HealthTier {
    /// Returns the fixed multiplier for this tier.
    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Healthy => HEALTH_HEALTHY,
            Self::Degraded => HEALTH_DEGRADED,
            Self::Critical => HEALTH_CRITICAL,
            Self::Offline => HEALTH_OFFLINE,
        }
    }
}

/// Diagnostic view of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStatus {
    /// Endpoint name.
    pub endpoint: String,
    /// Requests currently inside the window.
    pub occupancy: usize,
    /// Configured window capacity (without burst).
    pub capacity: usize,
    /// Time until the oldest request leaves the window.
    pub next_free_slot: Option<Duration>,
    /// Wait that a single request would currently be asked to observe.
    pub current_delay: Duration,
    /// Current health multiplier.
    pub health_multiplier: f64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct EndpointRuntime {
    window: RollingWindow,
    health: f64,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct Endpoint {
    config: RateLimitConfig,
    runtime: Mutex<EndpointRuntime>,
}

impl Endpoint {
    fn new(config: RateLimitConfig) -> Self {
        let runtime = EndpointRuntime {
            window: RollingWindow::new(config.window()),
            health: HEALTH_HEALTHY,
            consecutive_failures: 0,
        };
        Self {
            config,
            runtime: Mutex::new(runtime),
        }
    }

    fn capacity(&self, health: f64) -> usize {
        if health <= HEALTH_HEALTHY {
            self.config.window_capacity + self.config.burst_allowance
        } else {
            self.config.window_capacity
        }
    }

    fn compute_wait(&self, runtime: &mut EndpointRuntime, now: Instant, size: usize) -> Duration {
        let capacity = self.capacity(runtime.health);
        let window_wait = runtime.window.time_until_room(now, capacity, size).as_secs_f64()
            * runtime.health.max(HEALTH_HEALTHY);

        #[allow(clippy::cast_possible_wrap)]
        let exponent = runtime.consecutive_failures.min(MAX_BACKOFF_EXPONENT) as i32;
        let backoff = (self.config.base_delay().as_secs_f64() * 2f64.powi(exponent))
            .min(self.config.max_delay().as_secs_f64());

        let mut wait = window_wait.max(backoff);
        if size > 1 {
            #[allow(clippy::cast_precision_loss)]
            let batch = (1.0 + (size - 1) as f64 * BATCH_STEP).min(MAX_BATCH_MULTIPLIER);
            wait *= batch;
        }

        Duration::from_secs_f64(wait.clamp(0.0, MAX_WAIT.as_secs_f64()))
    }
}

/// Adaptive per-endpoint rate limiter.
///
/// The endpoint set is fixed at construction. Asking about an endpoint that
/// was not configured is a programming error and returns
/// [`RateLimitError::UnknownEndpoint`].
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    endpoints: HashMap<String, Endpoint>,
}

impl AdaptiveRateLimiter {
    /// Creates a limiter for the given endpoint configurations.
    #[must_use]
    pub fn new(configs: HashMap<String, RateLimitConfig>) -> Self {
        debug!(endpoints = configs.len(), "creating adaptive rate limiter");
        let endpoints = configs
            .into_iter()
            .map(|(name, config)| (name, Endpoint::new(config)))
            .collect();
        Self { endpoints }
    }

    /// Returns whether `name` is a configured endpoint.
    #[must_use]
    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Returns the configured endpoint names.
    pub fn endpoint_names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    fn endpoint(&self, name: &str) -> Result<&Endpoint, RateLimitError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| RateLimitError::UnknownEndpoint {
                name: name.to_string(),
            })
    }

    /// Returns whether `size` more requests fit in the endpoint's window.
    ///
    /// Remaining headroom is divided by the health multiplier when the
    /// endpoint is degraded. This is a hint; callers still honor
    /// [`wait_time`](Self::wait_time).
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::UnknownEndpoint`] for unconfigured names.
    pub fn can_proceed(&self, name: &str, size: usize) -> Result<bool, RateLimitError> {
        let endpoint = self.endpoint(name)?;
        let mut runtime = endpoint.runtime.lock();
        let now = Instant::now();

        let occupancy = runtime.window.occupancy(now);
        let capacity = endpoint.capacity(runtime.health);
        #[allow(clippy::cast_precision_loss)]
        let mut remaining = capacity.saturating_sub(occupancy) as f64;
        if runtime.health > HEALTH_HEALTHY {
            remaining /= runtime.health;
        }

        #[allow(clippy::cast_precision_loss)]
        let fits = size as f64 <= remaining;
        Ok(fits)
    }

    /// Computes how long a caller should wait before sending `size` requests.
    ///
    /// The larger of the window wait (scaled by health) and the failure
    /// backoff, scaled for batches and clamped to [`MAX_WAIT`]. Does not sleep.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::UnknownEndpoint`] for unconfigured names.
    pub fn wait_time(&self, name: &str, size: usize) -> Result<Duration, RateLimitError> {
        let endpoint = self.endpoint(name)?;
        let mut runtime = endpoint.runtime.lock();
        Ok(endpoint.compute_wait(&mut runtime, Instant::now(), size))
    }

    /// Records the outcome of `size` requests and updates endpoint health.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::UnknownEndpoint`] for unconfigured names.
    #[instrument(level = "debug", skip(self), fields(latency_ms = latency.as_millis()))]
    pub fn record(
        &self,
        name: &str,
        success: bool,
        latency: Duration,
        size: usize,
    ) -> Result<(), RateLimitError> {
        let endpoint = self.endpoint(name)?;
        let mut runtime = endpoint.runtime.lock();
        runtime.window.record(Instant::now(), size);

        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let factor = if success {
            runtime.consecutive_failures = 0;
            if latency_ms <= endpoint.config.fast_latency_ms {
                FAST_SUCCESS_FACTOR
            } else if latency_ms <= endpoint.config.slow_latency_ms {
                NORMAL_SUCCESS_FACTOR
            } else {
                SLOW_RESPONSE_FACTOR
            }
        } else {
            runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
            FAILURE_FACTOR
        };

        let previous = runtime.health;
        runtime.health = (runtime.health * factor).clamp(HEALTH_HEALTHY, HEALTH_OFFLINE);

        if runtime.health >= HEALTH_CRITICAL && previous < HEALTH_CRITICAL {
            warn!(
                endpoint = name,
                health = runtime.health,
                consecutive_failures = runtime.consecutive_failures,
                "endpoint health is critical"
            );
        } else {
            debug!(
                endpoint = name,
                health = runtime.health,
                consecutive_failures = runtime.consecutive_failures,
                "recorded request outcome"
            );
        }
        Ok(())
    }

    /// Returns a diagnostic snapshot of one endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::UnknownEndpoint`] for unconfigured names.
    pub fn snapshot(&self, name: &str) -> Result<EndpointStatus, RateLimitError> {
        let endpoint = self.endpoint(name)?;
        let mut runtime = endpoint.runtime.lock();
        let now = Instant::now();

        let occupancy = runtime.window.occupancy(now);
        let next_free_slot = runtime
            .window
            .next_expiry(now)
            .map(|at| at.saturating_duration_since(now));
        let current_delay = endpoint.compute_wait(&mut runtime, now, 1);

        Ok(EndpointStatus {
            endpoint: name.to_string(),
            occupancy,
            capacity: endpoint.config.window_capacity,
            next_free_slot,
            current_delay,
            health_multiplier: runtime.health,
            consecutive_failures: runtime.consecutive_failures,
        })
    }

    /// Overrides the health multiplier from an external health signal.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::UnknownEndpoint`] for unconfigured names.
    #[instrument(level = "debug", skip(self))]
    pub fn set_health(&self, name: &str, tier: HealthTier) -> Result<(), RateLimitError> {
        let endpoint = self.endpoint(name)?;
        endpoint.runtime.lock().health = tier.multiplier();
        debug!(endpoint = name, ?tier, "health overridden");
        Ok(())
    }
}
