//! Fixed-duration sliding counter of timestamped events.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Counts events that happened within the last `span`.
///
/// Timestamps are appended in non-decreasing order, so expiry only ever pops
/// from the front. Every query is amortized O(1).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: Duration,
    events: VecDeque<Instant>,
}

impl RollingWindow {
    /// Creates an empty window covering `span`.
    #[must_use]
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: VecDeque::new(),
        }
    }

    /// Returns the window duration.
    #[must_use]
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Records `count` events at `now`.
    pub fn record(&mut self, now: Instant, count: usize) {
        self.expire(now);
        self.events.extend(std::iter::repeat_n(now, count));
    }

    /// Returns the number of events still inside the window at `now`.
    pub fn occupancy(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.events.len()
    }

    /// Returns how long until `size` more events fit under `capacity`.
    ///
    /// Zero when they already fit. When `size` alone exceeds `capacity`, the
    /// answer is the time until the window is completely empty.
    pub fn time_until_room(&mut self, now: Instant, capacity: usize, size: usize) -> Duration {
        let occupied = self.occupancy(now);
        if occupied + size <= capacity {
            return Duration::ZERO;
        }

        let must_expire = (occupied + size - capacity).min(occupied);
        if must_expire == 0 {
            return Duration::ZERO;
        }

        self.events
            .get(must_expire - 1)
            .map_or(Duration::ZERO, |oldest| {
                (*oldest + self.span).saturating_duration_since(now)
            })
    }

    /// Returns when the oldest event leaves the window, if any event is held.
    pub fn next_expiry(&mut self, now: Instant) -> Option<Instant> {
        self.expire(now);
        self.events.front().map(|oldest| *oldest + self.span)
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if *oldest + self.span <= now {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_counts_recent_events() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.record(start, 3);
        assert_eq!(window.occupancy(start), 3);
        assert_eq!(window.occupancy(start + Duration::from_secs(9)), 3);
    }

    #[test]
    fn test_window_expires_old_events() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.record(start, 2);
        window.record(start + Duration::from_secs(5), 1);

        assert_eq!(window.occupancy(start + Duration::from_secs(10)), 1);
        assert_eq!(window.occupancy(start + Duration::from_secs(15)), 0);
    }

    #[test]
    fn test_time_until_room_zero_when_capacity_left() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.record(start, 2);
        assert_eq!(window.time_until_room(start, 5, 3), Duration::ZERO);
    }

    #[test]
    fn test_time_until_room_waits_for_oldest_needed_slot() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.record(start, 1);
        window.record(start + Duration::from_secs(4), 1);

        let now = start + Duration::from_secs(5);
        // One slot needed: the first event expires at t=10.
        assert_eq!(window.time_until_room(now, 2, 1), Duration::from_secs(5));
        // Two slots needed: the second event expires at t=14.
        assert_eq!(window.time_until_room(now, 2, 2), Duration::from_secs(9));
    }

    #[test]
    fn test_time_until_room_oversized_request_waits_for_empty_window() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.record(start, 1);
        window.record(start + Duration::from_secs(2), 1);
        assert_eq!(window.time_until_room(start + Duration::from_secs(2), 1, 5), Duration::from_secs(10));
    }

    #[test]
    fn test_next_expiry() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(10));
        assert!(window.next_expiry(start).is_none());
        window.record(start, 1);
        assert_eq!(window.next_expiry(start), Some(start + Duration::from_secs(10)));
    }
}
