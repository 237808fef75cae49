//! Last-known exchange-rate snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;
use tradewallet_common::Currency;

use crate::snapshot::ExchangeRateSnapshot;

/// Holds the current snapshot behind a single swappable pointer.
///
/// The lock only guards the `Arc` itself: writers swap in a fully built
/// snapshot and readers clone the `Arc` out, so no reader ever observes a
/// partially updated table and nobody holds the lock across I/O.
/// `None` means no fetch has succeeded yet.
pub struct RateCache {
    current: RwLock<Option<Arc<ExchangeRateSnapshot>>>,
    refreshes: AtomicU64,
    failures: AtomicU64,
    last_failure: RwLock<Option<DateTime<Utc>>>,
}

impl RateCache {
    /// Create an empty, not-ready cache.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        }
    }

    /// Current snapshot, or `None` before the first successful fetch.
    pub fn get_rates(&self) -> Option<Arc<ExchangeRateSnapshot>> {
        self.current.read().clone()
    }

    /// Rate for one currency; `None` if unknown or not ready.
    pub fn get_rate(&self, currency: &Currency) -> Option<Decimal> {
        self.current
            .read()
            .as_ref()
            .and_then(|snapshot| snapshot.rate(currency))
    }

    /// Whether a snapshot has been loaded.
    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    /// Swap in a new snapshot, returning the one it replaced.
    pub fn replace(&self, snapshot: ExchangeRateSnapshot) -> Option<Arc<ExchangeRateSnapshot>> {
        let snapshot = Arc::new(snapshot);
        debug!(
            base = %snapshot.base,
            rates = snapshot.len(),
            source = %snapshot.source,
            "Rate snapshot replaced"
        );
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.current.write().replace(snapshot)
    }

    /// Record a failed refresh; the current snapshot stays in place.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.write() = Some(Utc::now());
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let current = self.get_rates();
        CacheStats {
            ready: current.is_some(),
            currencies: current.as_ref().map(|s| s.len()).unwrap_or(0),
            last_refresh: current.as_ref().map(|s| s.fetched_at),
            last_failure: *self.last_failure.read(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub ready: bool,
    pub currencies: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub refreshes: u64,
    pub failures: u64,
}
