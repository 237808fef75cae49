//! Core ledger engine implementation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, instrument, warn};
use tradewallet_common::{TransactionId, WalletId};

use crate::balance::LedgerAudit;
use crate::error::{LedgerError, LedgerResult};
use crate::store::WalletStore;
use crate::transaction::{Transaction, TransactionBatch, TransactionType};
use crate::wallet::Wallet;

/// How a balance change reaches storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Transaction rows and wallet balances in one store commit.
    #[default]
    Atomic,
    /// Append the transaction, then save the wallet; undo the append if
    /// the save fails.
    Compensating,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Atomic => f.write_str("atomic"),
            WriteMode::Compensating => f.write_str("compensating"),
        }
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(WriteMode::Atomic),
            "compensating" => Ok(WriteMode::Compensating),
            other => Err(format!("unknown ledger write mode: {}", other)),
        }
    }
}

/// The ledger engine records balance changes with their history.
///
/// It performs no overdraft check; callers decide whether a change is
/// allowed against the balance they read.
pub struct LedgerEngine {
    store: Arc<dyn WalletStore>,
    mode: WriteMode,
}

impl LedgerEngine {
    /// Create a new ledger engine.
    pub fn new(store: Arc<dyn WalletStore>, mode: WriteMode) -> Self {
        Self { store, mode }
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Apply one signed change to `wallet` as read by the caller.
    ///
    /// Fails with `WalletConflict` if the wallet changed since it was read.
    #[instrument(skip(self, wallet), fields(wallet_id = %wallet.id, mode = %self.mode))]
    pub async fn apply_transaction(
        &self,
        wallet: &Wallet,
        kind: TransactionType,
        change: Decimal,
    ) -> LedgerResult<Transaction> {
        match self.mode {
            WriteMode::Atomic => {
                let batch = TransactionBatch::single(wallet, kind, change);
                let mut applied = self.store.commit(&batch).await?;
                applied
                    .pop()
                    .ok_or_else(|| LedgerError::Storage("commit returned no transaction".to_string()))
            }
            WriteMode::Compensating => self.apply_with_compensation(wallet, kind, change).await,
        }
    }

    /// Apply every leg of `batch`, in order.
    ///
    /// In atomic mode the legs land together or not at all. In compensating
    /// mode a failure after the first leg leaves earlier legs applied and
    /// is reported as `PartialBatch`.
    #[instrument(skip(self, batch), fields(legs = batch.len(), mode = %self.mode))]
    pub async fn apply_batch(&self, batch: &TransactionBatch) -> LedgerResult<Vec<Transaction>> {
        if self.mode == WriteMode::Atomic {
            return self.store.commit(batch).await;
        }

        let total = batch.len();
        let mut working: HashMap<WalletId, Wallet> = HashMap::new();
        let mut applied = Vec::with_capacity(total);

        for entry in batch.entries() {
            let wallet = working.get(&entry.wallet.id).unwrap_or(&entry.wallet).clone();

            match self.apply_with_compensation(&wallet, entry.kind, entry.change).await {
                Ok(tx) => {
                    let mut next = wallet;
                    next.balance = tx.balance;
                    next.version = tx.sequence;
                    working.insert(next.id, next);
                    applied.push(tx);
                }
                Err(e @ LedgerError::CompensationFailed { .. }) => return Err(e),
                Err(e) if applied.is_empty() => return Err(e),
                Err(e) => {
                    error!(
                        applied = applied.len(),
                        total,
                        error = %e,
                        "Batch stopped after a partial write"
                    );
                    return Err(LedgerError::PartialBatch {
                        applied: applied.len(),
                        total,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(applied)
    }

    async fn apply_with_compensation(
        &self,
        wallet: &Wallet,
        kind: TransactionType,
        change: Decimal,
    ) -> LedgerResult<Transaction> {
        let tx = Transaction::next(wallet, kind, change)?;
        self.store.create_transaction(&tx).await?;

        let mut updated = wallet.clone();
        updated.balance = tx.balance;

        match self.store.save_wallet(&updated).await {
            Ok(_) => {
                debug!(transaction_id = %tx.id, balance = %tx.balance, "Transaction applied");
                Ok(tx)
            }
            Err(save_err) => Err(self.compensate(tx.id, save_err).await),
        }
    }

    /// Remove an appended transaction whose wallet save failed.
    async fn compensate(&self, transaction_id: TransactionId, cause: LedgerError) -> LedgerError {
        match self.store.remove_transaction(transaction_id).await {
            Ok(_) => {
                warn!(%transaction_id, error = %cause, "Wallet save failed, transaction removed");
                cause
            }
            Err(remove_err) => {
                error!(
                    %transaction_id,
                    save_error = %cause,
                    remove_error = %remove_err,
                    "Compensation failed, ledger left inconsistent"
                );
                LedgerError::CompensationFailed {
                    transaction_id,
                    reason: format!("{}; removal failed: {}", cause, remove_err),
                }
            }
        }
    }

    /// History of a wallet ordered by sequence.
    pub async fn history(&self, wallet_id: WalletId) -> LedgerResult<Vec<Transaction>> {
        self.store.transactions(wallet_id).await
    }

    /// Replay a wallet's history against its stored balance.
    pub async fn verify_wallet(&self, wallet_id: WalletId) -> LedgerResult<LedgerAudit> {
        let wallet = self
            .store
            .get_wallet_by_id(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::InvalidWallet(wallet_id.to_string()))?;
        let history = self.store.transactions(wallet_id).await?;

        Ok(LedgerAudit::check(&wallet, &history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryWalletStore, StoreFault};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use tradewallet_common::{Currency, UserId};

    async fn setup(mode: WriteMode) -> (Arc<InMemoryWalletStore>, LedgerEngine, Wallet) {
        let store = Arc::new(InMemoryWalletStore::new());
        let engine = LedgerEngine::new(store.clone(), mode);
        let wallet = store
            .get_or_create_wallet(UserId::new(1), &Currency::usd())
            .await
            .unwrap();
        (store, engine, wallet)
    }

    async fn reload(store: &InMemoryWalletStore, wallet: &Wallet) -> Wallet {
        store.get_wallet_by_id(wallet.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_apply_transaction_both_modes() {
        for mode in [WriteMode::Atomic, WriteMode::Compensating] {
            let (store, engine, wallet) = setup(mode).await;

            let tx = engine
                .apply_transaction(&wallet, TransactionType::Deposit, dec!(100))
                .await
                .unwrap();

            assert_eq!(tx.balance, dec!(100));
            assert_eq!(tx.kind, TransactionType::Deposit);
            let wallet = reload(&store, &wallet).await;
            assert_eq!(wallet.balance, dec!(100));
            assert_eq!(wallet.version, 1);
            assert!(engine.verify_wallet(wallet.id).await.unwrap().is_consistent());
        }
    }

    #[tokio::test]
    async fn test_no_overdraft_check_in_primitive() {
        let (_, engine, wallet) = setup(WriteMode::Atomic).await;

        let tx = engine
            .apply_transaction(&wallet, TransactionType::Withdraw, dec!(-5))
            .await
            .unwrap();

        assert_eq!(tx.balance, dec!(-5));
    }

    #[tokio::test]
    async fn test_unknown_wallet_is_invalid() {
        for mode in [WriteMode::Atomic, WriteMode::Compensating] {
            let (_, engine, _) = setup(mode).await;
            let stranger = Wallet::new(UserId::new(9), Currency::usd());

            let err = engine
                .apply_transaction(&stranger, TransactionType::Deposit, dec!(1))
                .await
                .unwrap_err();

            assert!(matches!(err, LedgerError::InvalidWallet(_)));
            assert!(matches!(
                engine.verify_wallet(stranger.id).await,
                Err(LedgerError::InvalidWallet(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_stale_wallet_conflicts() {
        let (_, engine, wallet) = setup(WriteMode::Atomic).await;
        engine
            .apply_transaction(&wallet, TransactionType::Deposit, dec!(10))
            .await
            .unwrap();

        let err = engine
            .apply_transaction(&wallet, TransactionType::Deposit, dec!(10))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_save_is_compensated() {
        let (store, engine, wallet) = setup(WriteMode::Compensating).await;
        store.inject_fault(StoreFault::FailNextSave);

        let err = engine
            .apply_transaction(&wallet, TransactionType::Deposit, dec!(100))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(reload(&store, &wallet).await.balance, Decimal::ZERO);
        assert!(engine.verify_wallet(wallet.id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_failed_compensation_is_reported() {
        let (store, engine, wallet) = setup(WriteMode::Compensating).await;
        store.inject_fault(StoreFault::FailNextSave);
        store.inject_fault(StoreFault::FailNextRemove);

        let err = engine
            .apply_transaction(&wallet, TransactionType::Deposit, dec!(100))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::CompensationFailed { .. }));
        let audit = engine.verify_wallet(wallet.id).await.unwrap();
        assert!(!audit.is_consistent());
        assert_eq!(audit.transactions, 1);
    }

    #[tokio::test]
    async fn test_atomic_failure_leaves_no_trace() {
        let (store, engine, usd) = setup(WriteMode::Atomic).await;
        let btc = store
            .get_or_create_wallet(UserId::new(1), &Currency::btc())
            .await
            .unwrap();

        let mut batch = TransactionBatch::new();
        batch.add_entry(&usd, TransactionType::Sell, dec!(-250));
        batch.add_entry(&btc, TransactionType::Buy, dec!(0.01));
        store.inject_fault(StoreFault::FailNextCommit);

        assert!(engine.apply_batch(&batch).await.is_err());
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(reload(&store, &btc).await.version, 0);
    }

    #[tokio::test]
    async fn test_compensating_batch_reports_partial_write() {
        let (store, engine, usd) = setup(WriteMode::Compensating).await;
        let btc = store
            .get_or_create_wallet(UserId::new(1), &Currency::btc())
            .await
            .unwrap();
        // Someone else touches the BTC wallet after it was read.
        engine
            .apply_transaction(&btc, TransactionType::Deposit, dec!(1))
            .await
            .unwrap();

        let mut batch = TransactionBatch::new();
        batch.add_entry(&usd, TransactionType::Sell, dec!(-250));
        batch.add_entry(&btc, TransactionType::Buy, dec!(0.01));

        let err = engine.apply_batch(&batch).await.unwrap_err();

        assert!(matches!(
            err,
            LedgerError::PartialBatch { applied: 1, total: 2, .. }
        ));
        assert_eq!(reload(&store, &usd).await.balance, dec!(-250));
        assert!(engine.verify_wallet(btc.id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_history_in_order() {
        let (store, engine, wallet) = setup(WriteMode::Atomic).await;
        engine
            .apply_transaction(&wallet, TransactionType::Deposit, dec!(100))
            .await
            .unwrap();
        let wallet = reload(&store, &wallet).await;
        engine
            .apply_transaction(&wallet, TransactionType::Withdraw, dec!(-40))
            .await
            .unwrap();

        let history = engine.history(wallet.id).await.unwrap();

        let balances: Vec<_> = history.iter().map(|t| t.balance).collect();
        assert_eq!(balances, vec![dec!(100), dec!(60)]);
    }

    #[test]
    fn test_write_mode_parse() {
        assert_eq!("atomic".parse::<WriteMode>().unwrap(), WriteMode::Atomic);
        assert_eq!(" Compensating ".parse::<WriteMode>().unwrap(), WriteMode::Compensating);
        assert!("eventual".parse::<WriteMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_balance_is_prefix_sum(
            compensating in any::<bool>(),
            ops in prop::collection::vec((any::<bool>(), 1i64..1_000_000i64, 0u8..10), 1..40),
        ) {
            let mode = if compensating { WriteMode::Compensating } else { WriteMode::Atomic };

            tokio_test::block_on(async {
                let (store, engine, wallet) = setup(mode).await;

                for (deposit, cents, fault) in ops {
                    let (kind, change) = if deposit {
                        (TransactionType::Deposit, Decimal::new(cents, 2))
                    } else {
                        (TransactionType::Withdraw, -Decimal::new(cents, 2))
                    };
                    if fault == 0 {
                        store.inject_fault(StoreFault::FailNextSave);
                        store.inject_fault(StoreFault::FailNextCommit);
                    }

                    let current = reload(&store, &wallet).await;
                    let _ = engine.apply_transaction(&current, kind, change).await;
                    store.clear_faults();
                }

                let audit = engine.verify_wallet(wallet.id).await.unwrap();
                let history = engine.history(wallet.id).await.unwrap();
                assert!(audit.is_consistent(), "{:?}", audit.violations);
                assert_eq!(audit.latest.unwrap_or(Decimal::ZERO), audit.balance);
                assert_eq!(history.iter().map(|t| t.change).sum::<Decimal>(), audit.balance);
            });
        }
    }
}
