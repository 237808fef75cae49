//! Persistence boundary for wallets and their transactions.

use async_trait::async_trait;
use tradewallet_common::{Currency, TransactionId, UserId, WalletId};

use crate::error::LedgerResult;
use crate::transaction::{Transaction, TransactionBatch};
use crate::wallet::Wallet;

/// Storage for wallets and the append-only transaction history.
///
/// At most one wallet exists per (owner, currency), including under
/// concurrent `get_or_create_wallet` calls.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Wallet for (owner, currency); `None` if it was never created.
    async fn get_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Option<Wallet>>;

    /// Wallet by id.
    async fn get_wallet_by_id(&self, id: WalletId) -> LedgerResult<Option<Wallet>>;

    /// Existing wallet, or a new zero-balance one.
    async fn get_or_create_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Wallet>;

    /// Every wallet of an owner, ordered by currency.
    async fn list_wallets(&self, owner: UserId) -> LedgerResult<Vec<Wallet>>;

    /// Persist `wallet.balance` if the stored version still equals
    /// `wallet.version`; returns the wallet with its bumped version.
    ///
    /// Fails with `InvalidWallet` for an unknown id and `WalletConflict`
    /// when another writer got there first.
    async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<Wallet>;

    /// Append one transaction row.
    async fn create_transaction(&self, tx: &Transaction) -> LedgerResult<()>;

    /// Remove one transaction row; `false` if it did not exist.
    async fn remove_transaction(&self, id: TransactionId) -> LedgerResult<bool>;

    /// History of a wallet ordered by sequence.
    async fn transactions(&self, wallet_id: WalletId) -> LedgerResult<Vec<Transaction>>;

    /// Apply every leg of `batch` or none of them.
    ///
    /// Each leg's wallet version is checked, its transaction appended and
    /// the wallet balance updated as one unit. Legs on the same wallet
    /// chain in order.
    async fn commit(&self, batch: &TransactionBatch) -> LedgerResult<Vec<Transaction>>;
}
