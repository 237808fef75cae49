//! Timing defaults for the wallet service.

/// Default schedule and timeout values.
pub mod constants {
    use std::time::Duration;

    /// Exchange-rate refresh interval (30 seconds).
    pub fn rate_refresh_interval() -> Duration {
        Duration::from_secs(30)
    }

    /// Subscriber broadcast interval (5 seconds).
    pub fn rate_broadcast_interval() -> Duration {
        Duration::from_secs(5)
    }

    /// Upper bound for one upstream rate request (10 seconds).
    pub fn rate_fetch_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Idle wallet lock pruning interval (60 seconds).
    pub fn lock_prune_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Drain timeout when stopping background tasks (5 seconds).
    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

/// Queue and retry sizing.
pub mod limits {
    /// Pending snapshots buffered per subscriber before it counts as lagging.
    pub const SUBSCRIBER_BUFFER: usize = 16;

    /// Attempts for a balance mutation that keeps hitting version conflicts.
    pub const TRADE_MAX_ATTEMPTS: u32 = 5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_faster_than_refresh() {
        assert!(constants::rate_broadcast_interval() < constants::rate_refresh_interval());
        assert!(constants::rate_fetch_timeout() < constants::rate_refresh_interval());
    }
}
