//! Request admission control.
//!
//! - [`AdaptiveRateLimiter`] - per-endpoint rolling-window limits with
//!   health-based backoff, consulted before each work item is submitted.
//! - [`IntervalLimiter`] - per-host minimum spacing between individual HTTP
//!   attempts, including retries.

mod adaptive;
mod interval;
mod window;

pub use adaptive::{
    AdaptiveRateLimiter, EndpointStatus, HEALTH_CRITICAL, HEALTH_DEGRADED, HEALTH_HEALTHY,
    HEALTH_OFFLINE, HealthTier, MAX_WAIT, RateLimitConfig, RateLimitError,
};
pub use interval::{IntervalLimiter, extract_host, parse_retry_after};
pub use window::RollingWindow;
