//! In-process wallet store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use tradewallet_common::{Currency, TransactionId, UserId, WalletId, WalletKey};

use crate::error::{LedgerError, LedgerResult};
use crate::store::WalletStore;
use crate::transaction::{Transaction, TransactionBatch};
use crate::wallet::Wallet;

/// One-shot storage failure, consumed by the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFault {
    FailNextSave,
    FailNextRemove,
    FailNextCommit,
    FailNextCreateTransaction,
}

#[derive(Default)]
struct Inner {
    wallets: HashMap<WalletId, Wallet>,
    index: HashMap<WalletKey, WalletId>,
    transactions: HashMap<WalletId, Vec<Transaction>>,
    faults: HashSet<StoreFault>,
}

impl Inner {
    fn take_fault(&mut self, fault: StoreFault) -> LedgerResult<()> {
        if self.faults.remove(&fault) {
            debug!(?fault, "Injected storage fault triggered");
            return Err(LedgerError::Storage(format!("injected fault: {:?}", fault)));
        }
        Ok(())
    }

    fn check_version(&self, wallet: &Wallet) -> LedgerResult<&Wallet> {
        let stored = self
            .wallets
            .get(&wallet.id)
            .ok_or_else(|| LedgerError::InvalidWallet(wallet.id.to_string()))?;

        if stored.version != wallet.version {
            return Err(LedgerError::WalletConflict {
                wallet_id: wallet.id,
                expected: wallet.version,
                actual: stored.version,
            });
        }
        Ok(stored)
    }
}

/// Wallet store kept in memory.
///
/// All state sits behind one mutex, so every trait call is a single
/// critical section and `commit` is trivially all-or-nothing.
#[derive(Default)]
pub struct InMemoryWalletStore {
    inner: Mutex<Inner>,
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure.
    pub fn inject_fault(&self, fault: StoreFault) {
        self.inner.lock().faults.insert(fault);
    }

    /// Disarm every pending failure.
    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    pub fn wallet_count(&self) -> usize {
        self.inner.lock().wallets.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().transactions.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Option<Wallet>> {
        let inner = self.inner.lock();
        let key = WalletKey::new(owner, currency.clone());
        Ok(inner
            .index
            .get(&key)
            .and_then(|id| inner.wallets.get(id))
            .cloned())
    }

    async fn get_wallet_by_id(&self, id: WalletId) -> LedgerResult<Option<Wallet>> {
        Ok(self.inner.lock().wallets.get(&id).cloned())
    }

    async fn get_or_create_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Wallet> {
        let mut inner = self.inner.lock();
        let key = WalletKey::new(owner, currency.clone());

        if let Some(wallet) = inner.index.get(&key).and_then(|id| inner.wallets.get(id)) {
            return Ok(wallet.clone());
        }

        let wallet = Wallet::new(owner, currency.clone());
        inner.index.insert(key, wallet.id);
        inner.wallets.insert(wallet.id, wallet.clone());
        debug!(owner = %owner, currency = %currency, wallet_id = %wallet.id, "Wallet created");
        Ok(wallet)
    }

    async fn list_wallets(&self, owner: UserId) -> LedgerResult<Vec<Wallet>> {
        let inner = self.inner.lock();
        let mut wallets: Vec<Wallet> = inner
            .wallets
            .values()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(wallets)
    }

    async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<Wallet> {
        let mut inner = self.inner.lock();
        inner.check_version(wallet)?;
        inner.take_fault(StoreFault::FailNextSave)?;

        let stored = inner
            .wallets
            .get_mut(&wallet.id)
            .ok_or_else(|| LedgerError::InvalidWallet(wallet.id.to_string()))?;
        stored.balance = wallet.balance;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn create_transaction(&self, tx: &Transaction) -> LedgerResult<()> {
        let mut inner = self.inner.lock();
        let current = inner
            .wallets
            .get(&tx.wallet_id)
            .ok_or_else(|| LedgerError::InvalidWallet(tx.wallet_id.to_string()))?;
        if tx.sequence != current.version + 1 {
            return Err(LedgerError::WalletConflict {
                wallet_id: tx.wallet_id,
                expected: tx.sequence.saturating_sub(1),
                actual: current.version,
            });
        }
        inner.take_fault(StoreFault::FailNextCreateTransaction)?;

        let history = inner.transactions.entry(tx.wallet_id).or_default();
        let position = history.partition_point(|t| t.sequence <= tx.sequence);
        history.insert(position, tx.clone());
        Ok(())
    }

    async fn remove_transaction(&self, id: TransactionId) -> LedgerResult<bool> {
        let mut inner = self.inner.lock();
        inner.take_fault(StoreFault::FailNextRemove)?;

        for history in inner.transactions.values_mut() {
            if let Some(position) = history.iter().position(|t| t.id == id) {
                history.remove(position);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn transactions(&self, wallet_id: WalletId) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .inner
            .lock()
            .transactions
            .get(&wallet_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, batch: &TransactionBatch) -> LedgerResult<Vec<Transaction>> {
        let mut inner = self.inner.lock();

        // Stage every leg against working copies before touching state.
        let mut working: HashMap<WalletId, Wallet> = HashMap::new();
        let mut staged = Vec::with_capacity(batch.len());

        for entry in batch.entries() {
            let current = match working.get(&entry.wallet.id) {
                Some(wallet) => wallet.clone(),
                None => inner.check_version(&entry.wallet)?.clone(),
            };

            let tx = Transaction::next(&current, entry.kind, entry.change)?;
            let mut next = current;
            next.balance = tx.balance;
            next.version = tx.sequence;
            next.updated_at = tx.created_at;

            working.insert(next.id, next);
            staged.push(tx);
        }

        inner.take_fault(StoreFault::FailNextCommit)?;

        for tx in &staged {
            inner
                .transactions
                .entry(tx.wallet_id)
                .or_default()
                .push(tx.clone());
        }
        for (id, wallet) in working {
            inner.wallets.insert(id, wallet);
        }

        Ok(staged)
    }
}
