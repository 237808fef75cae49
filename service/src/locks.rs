//! Per-wallet mutual exclusion for balance read-modify-write.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use tradewallet_common::WalletKey;

/// Lock table keyed by (owner, currency).
///
/// Entries are created on first use and dropped by [`WalletLocks::prune_idle`]
/// once nobody holds or waits on them.
#[derive(Default)]
pub struct WalletLocks {
    locks: DashMap<WalletKey, Arc<Mutex<()>>>,
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key, in sorted order, and hold them until the guard drops.
    ///
    /// Sorting makes two callers that need the same pair of wallets take
    /// them in the same order, so they cannot deadlock.
    pub async fn acquire(&self, keys: &[WalletKey]) -> WalletGuard {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }

        WalletGuard {
            keys,
            _guards: guards,
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries no task holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let pruned = before.saturating_sub(self.locks.len());
        if pruned > 0 {
            debug!(pruned, remaining = self.locks.len(), "Idle wallet locks pruned");
        }
        pruned
    }
}

/// Held wallet locks.
pub struct WalletGuard {
    keys: Vec<WalletKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl WalletGuard {
    /// Keys held, sorted.
    pub fn keys(&self) -> &[WalletKey] {
        &self.keys
    }
}
