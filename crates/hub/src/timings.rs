use std::time::Duration;

/// Fixed delays of the background loops and subscriber sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Wait after the watch feed breaks.
    pub stream_backoff: Duration,
    /// Wait after acquisition fails.
    pub auth_backoff: Duration,
    /// Subscriber idleness that triggers a heartbeat.
    pub heartbeat_after: Duration,
    /// Bounded wait on a subscriber's inbound queue per loop iteration.
    pub poll_wait: Duration,
    pub stats_interval: Duration,
    /// Pause between a scale action and the stats recomputation it triggers.
    pub settle_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stream_backoff: Duration::from_secs(5),
            auth_backoff: Duration::from_secs(30),
            heartbeat_after: Duration::from_secs(30),
            poll_wait: Duration::from_secs(1),
            stats_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
        }
    }
}
