//! Pool counters and their sampled snapshots.

use std::time::Duration;

/// Counter state, owned by the pool region. Cumulative counters only ever
/// grow; the period-local gauges are rolled into their "recent" slots by
/// [`sample`][PoolMetrics::sample] and reset.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    pub(crate) opened: u64,
    pub(crate) served: u64,
    pub(crate) rejected_full: u64,
    pub(crate) rejected_timeout: u64,
    pub(crate) rejected_other: u64,
    pub(crate) connection_failures: u64,
    pub(crate) connection_leaks: u64,

    // Gauges for the current sampling period.
    waiting_time_ms: u64,
    waiter_count: u32,
    busy_min: u32,
    busy_max: u32,

    // All-time high-waters.
    waiting_high_ms: u64,
    waiters_high: u32,

    // Rolled snapshots from the last completed period.
    waiting_high_recent_ms: u64,
    waiters_high_recent: u32,
    busy_min_recent: u32,
    busy_max_recent: u32,
}

impl PoolMetrics {
    /// High-water of concurrently parked callers in this period.
    pub(crate) fn note_waiters(&mut self, current: u32) {
        self.waiter_count = self.waiter_count.max(current);
    }

    /// High-water of a single caller's time spent parked in this period.
    pub(crate) fn note_waiting_time(&mut self, waited: Duration) {
        self.waiting_time_ms = self.waiting_time_ms.max(waited.as_millis() as u64);
    }

    /// Track the busy-connection envelope for this period.
    pub(crate) fn note_busy(&mut self, busy: u32) {
        self.busy_min = self.busy_min.min(busy);
        self.busy_max = self.busy_max.max(busy);
    }

    /// Roll the period gauges into their "recent" snapshots and start a new
    /// period anchored at the current busy count.
    pub(crate) fn sample(&mut self, busy: u32) {
        self.waiting_high_recent_ms = self.waiting_time_ms;
        self.waiting_high_ms = self.waiting_high_ms.max(self.waiting_time_ms);
        self.waiting_time_ms = 0;

        self.waiters_high_recent = self.waiter_count;
        self.waiters_high = self.waiters_high.max(self.waiter_count);
        self.waiter_count = 0;

        self.busy_max_recent = self.busy_max;
        self.busy_min_recent = self.busy_min;
        self.busy_min = busy;
        self.busy_max = busy;
    }

    pub(crate) fn snapshot(&self, size: u32, idle: u32, busy: u32, waiters: u32) -> PoolStatus {
        PoolStatus {
            size,
            idle,
            busy,
            waiters,
            opened: self.opened,
            served: self.served,
            rejected_full: self.rejected_full,
            rejected_timeout: self.rejected_timeout,
            rejected_other: self.rejected_other,
            connection_failures: self.connection_failures,
            connection_leaks: self.connection_leaks,
            waiters_high: self.waiters_high.max(self.waiter_count),
            waiters_high_recent: self.waiters_high_recent,
            waiting_high: Duration::from_millis(self.waiting_high_ms.max(self.waiting_time_ms)),
            waiting_high_recent: Duration::from_millis(self.waiting_high_recent_ms),
            busy_min_recent: self.busy_min_recent,
            busy_max_recent: self.busy_max_recent,
        }
    }
}

/// Point-in-time view of a pool, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStatus {
    /// Connections currently owned by the pool, busy or idle.
    pub size: u32,
    /// Connections parked in the free set.
    pub idle: u32,
    /// Connections with at least one outstanding hold.
    pub busy: u32,
    /// Callers currently parked waiting for a connection.
    pub waiters: u32,
    /// Physical connections opened over the pool's lifetime.
    pub opened: u64,
    /// Acquisitions that returned successfully.
    pub served: u64,
    /// Acquisitions refused because the pool was saturated with no waiter
    /// budget.
    pub rejected_full: u64,
    /// Acquisitions that waited out their budget.
    pub rejected_timeout: u64,
    /// Acquisitions refused for any other reason (driver failures included).
    pub rejected_other: u64,
    /// Physical opens the driver refused.
    pub connection_failures: u64,
    /// Connections reclaimed because a caller held them past the open-time
    /// limit.
    pub connection_leaks: u64,
    /// All-time high-water of parked callers.
    pub waiters_high: u32,
    /// Parked-caller high-water in the last completed sampling period.
    pub waiters_high_recent: u32,
    /// All-time high-water of a single caller's parked time.
    pub waiting_high: Duration,
    /// Parked-time high-water in the last completed sampling period.
    pub waiting_high_recent: Duration,
    /// Busy-count envelope over the last completed sampling period.
    pub busy_min_recent: u32,
    pub busy_max_recent: u32,
}

#[cfg(test)]
mod tests {
    use super::PoolMetrics;
    use std::time::Duration;

    #[test]
    fn sample_rolls_gauges_into_recent_and_resets() {
        let mut metrics = PoolMetrics::default();

        metrics.note_busy(3);
        metrics.note_waiters(2);
        metrics.note_waiters(1);
        metrics.note_waiting_time(Duration::from_millis(40));
        metrics.note_waiting_time(Duration::from_millis(25));

        metrics.sample(1);

        let status = metrics.snapshot(4, 3, 1, 0);
        assert_eq!(status.waiters_high_recent, 2);
        assert_eq!(status.waiters_high, 2);
        assert_eq!(status.waiting_high_recent, Duration::from_millis(40));
        assert_eq!(status.waiting_high, Duration::from_millis(40));
        assert_eq!(status.busy_min_recent, 0);
        assert_eq!(status.busy_max_recent, 3);

        // A quiet period rolls zeros but keeps the cumulative high-waters.
        metrics.sample(1);
        let status = metrics.snapshot(4, 3, 1, 0);
        assert_eq!(status.waiters_high_recent, 0);
        assert_eq!(status.waiters_high, 2);
        assert_eq!(status.waiting_high_recent, Duration::ZERO);
        assert_eq!(status.busy_min_recent, 1);
        assert_eq!(status.busy_max_recent, 1);
    }
}
