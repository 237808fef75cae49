//! Simulation metrics.

use std::collections::VecDeque;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total operations issued.
    pub total_operations: u64,
    /// Operations that changed balances.
    pub completed: u64,
    /// Operations declined for insufficient balance.
    pub declined: u64,
    /// Operations that returned an error.
    pub failed: u64,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            completed: 0,
            declined: 0,
            failed: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    pub fn record_completed(&mut self, latency_us: u64) {
        self.completed += 1;
        self.record(latency_us);
    }

    pub fn record_declined(&mut self, latency_us: u64) {
        self.declined += 1;
        self.record(latency_us);
    }

    pub fn record_failure(&mut self) {
        self.total_operations += 1;
        self.failed += 1;
    }

    fn record(&mut self, latency_us: u64) {
        self.total_operations += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of operations that did not error. Declines count as answered.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        (self.completed + self.declined) as f64 / self.total_operations as f64
    }

    /// Operations per second over `elapsed_secs`.
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_operations as f64 / elapsed_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
