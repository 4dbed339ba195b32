//! Per-host minimum interval between HTTP attempts.
//!
//! The [`IntervalLimiter`] spaces consecutive requests to the same host by a
//! fixed delay and honors server-imposed holds (from `Retry-After`). Requests
//! to different hosts never wait on each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use collector_core::ratelimit::IntervalLimiter;
//!
//! # async fn example() {
//! let limiter = IntervalLimiter::new(Duration::from_millis(500));
//! limiter.acquire("https://arxiv.org/pdf/1.pdf").await;
//! limiter.acquire("https://arxiv.org/pdf/2.pdf").await; // waits ~500ms
//! limiter.acquire("https://openreview.net/pdf?id=x").await; // immediate
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Upper bound accepted from a `Retry-After` header.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host spacing of HTTP attempts.
///
/// Wrap in `Arc` to share across tasks. Host state lives in a `DashMap`; the
/// map guard is released before awaiting on the per-host mutex.
#[derive(Debug)]
pub struct IntervalLimiter {
    min_interval: Duration,
    disabled: bool,
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug, Default)]
struct HostSlot {
    last_request: Option<Instant>,
    hold_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct HostState {
    slot: Mutex<HostSlot>,
}

impl IntervalLimiter {
    /// Creates a limiter enforcing `min_interval` between requests to a host.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            disabled: min_interval.is_zero(),
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns whether spacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured minimum interval.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then claims the slot.
    ///
    /// The first request to a host proceeds immediately unless the server has
    /// imposed a hold.
    #[instrument(level = "debug", skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self.host_state(&host);
        let mut slot = state.slot.lock().await;
        let now = Instant::now();

        let spacing_ready = match slot.last_request {
            Some(last) if !self.disabled => last + self.min_interval,
            _ => now,
        };
        let ready_at = slot.hold_until.map_or(spacing_ready, |hold| hold.max(spacing_ready));

        if ready_at > now {
            debug!(
                host = %host,
                delay_ms = (ready_at - now).as_millis(),
                "spacing request to host"
            );
            tokio::time::sleep_until(ready_at).await;
        }

        slot.hold_until = None;
        slot.last_request = Some(Instant::now());
    }

    /// Records a server-mandated pause for `url`'s host.
    ///
    /// Applies even when spacing is disabled.
    #[instrument(level = "debug", skip(self), fields(host))]
    pub async fn hold(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let delay = delay.min(MAX_RETRY_AFTER);
        let until = Instant::now() + delay;
        let state = self.host_state(&host);
        let mut slot = state.slot.lock().await;
        slot.hold_until = Some(slot.hold_until.map_or(until, |existing| existing.max(until)));

        if delay >= Duration::from_secs(30) {
            warn!(
                host = %host,
                delay_secs = delay.as_secs(),
                "server requested a long pause"
            );
        }
    }
}

/// Extracts the lowercase host from a URL, or `"unknown"` when unparsable.
///
/// # Examples
///
/// ```
/// use collector_core::ratelimit::extract_host;
///
/// assert_eq!(extract_host("https://ArXiv.org/pdf/1.pdf"), "arxiv.org");
/// assert_eq!(extract_host("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` header (seconds or HTTP-date) into a delay.
///
/// Dates in the past yield zero. Values are capped at one hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use collector_core::ratelimit::parse_retry_after;
///
/// assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let date = httpdate::parse_http_date(value).ok()?;
    let delay = date
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(delay.min(MAX_RETRY_AFTER))
}
