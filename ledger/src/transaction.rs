//! Transaction records and multi-leg batches.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradewallet_common::{TransactionId, WalletId};

use crate::error::{LedgerError, LedgerResult};
use crate::wallet::Wallet;

/// Kind of balance change.
///
/// Codes match the persisted `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Buy,
    Sell,
    Withdraw,
    Deposit,
}

impl TransactionType {
    /// Storage code.
    pub fn code(self) -> i16 {
        match self {
            TransactionType::Buy => -1,
            TransactionType::Sell => 1,
            TransactionType::Withdraw => -2,
            TransactionType::Deposit => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::Deposit => "DEPOSIT",
        }
    }
}

impl TryFrom<i16> for TransactionType {
    type Error = LedgerError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(TransactionType::Buy),
            1 => Ok(TransactionType::Sell),
            -2 => Ok(TransactionType::Withdraw),
            2 => Ok(TransactionType::Deposit),
            other => Err(LedgerError::InvalidTransactionType(other)),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID.
    pub id: TransactionId,
    /// Wallet this transaction belongs to.
    pub wallet_id: WalletId,
    /// Transaction type.
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Signed balance change.
    pub change: Decimal,
    /// Wallet balance after this transaction.
    pub balance: Decimal,
    /// Position in the wallet's history, starting at 1.
    pub sequence: u64,
    /// When this transaction was created.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Build the transaction that follows the wallet's current state.
    pub fn next(wallet: &Wallet, kind: TransactionType, change: Decimal) -> LedgerResult<Self> {
        let balance = wallet
            .balance
            .checked_add(change)
            .ok_or(LedgerError::BalanceOverflow {
                wallet_id: wallet.id,
                change,
            })?;

        Ok(Self {
            id: TransactionId::new(),
            wallet_id: wallet.id,
            kind,
            change,
            balance,
            sequence: wallet.version + 1,
            created_at: Utc::now(),
        })
    }
}

/// One leg of a batch: a change against a wallet as it was read.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Wallet state the change was computed against.
    pub wallet: Wallet,
    /// Transaction type.
    pub kind: TransactionType,
    /// Signed balance change.
    pub change: Decimal,
}

/// Legs that must be committed together, in order.
#[derive(Debug, Clone, Default)]
pub struct TransactionBatch {
    entries: Vec<LedgerEntry>,
}

impl TransactionBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch with a single leg.
    pub fn single(wallet: &Wallet, kind: TransactionType, change: Decimal) -> Self {
        let mut batch = Self::new();
        batch.add_entry(wallet, kind, change);
        batch
    }

    /// Append a leg.
    pub fn add_entry(&mut self, wallet: &Wallet, kind: TransactionType, change: Decimal) {
        self.entries.push(LedgerEntry {
            wallet: wallet.clone(),
            kind,
            change,
        });
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct wallets the batch touches, in lock order.
    pub fn wallet_ids(&self) -> Vec<WalletId> {
        let mut ids: Vec<WalletId> = self.entries.iter().map(|e| e.wallet.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Net change the batch applies to one wallet.
    pub fn net_change(&self, wallet_id: WalletId) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.wallet.id == wallet_id)
            .map(|e| e.change)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tradewallet_common::{Currency, UserId};

    #[test]
    fn test_type_codes() {
        for kind in [
            TransactionType::Buy,
            TransactionType::Sell,
            TransactionType::Withdraw,
            TransactionType::Deposit,
        ] {
            assert_eq!(TransactionType::try_from(kind.code()).unwrap(), kind);
        }
        assert_eq!(TransactionType::Buy.code(), -1);
        assert_eq!(TransactionType::Deposit.code(), 2);

        let err = TransactionType::try_from(0).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransactionType(0)));
    }

    #[test]
    fn test_next_transaction() {
        let mut wallet = Wallet::new(UserId::new(1), Currency::usd());
        wallet.balance = dec!(100);
        wallet.version = 1;

        let tx = Transaction::next(&wallet, TransactionType::Sell, dec!(-25.5)).unwrap();

        assert_eq!(tx.balance, dec!(74.5));
        assert_eq!(tx.sequence, 2);
        assert_eq!(tx.wallet_id, wallet.id);
    }

    #[test]
    fn test_next_transaction_overflow() {
        let mut wallet = Wallet::new(UserId::new(1), Currency::usd());
        wallet.balance = Decimal::MAX;

        let err = Transaction::next(&wallet, TransactionType::Deposit, dec!(1)).unwrap_err();

        assert!(matches!(err, LedgerError::BalanceOverflow { wallet_id, .. } if wallet_id == wallet.id));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_batch_legs_keep_order() {
        let usd = Wallet::new(UserId::new(1), Currency::usd());
        let btc = Wallet::new(UserId::new(1), Currency::btc());

        let mut batch = TransactionBatch::new();
        batch.add_entry(&usd, TransactionType::Sell, dec!(-250));
        batch.add_entry(&btc, TransactionType::Buy, dec!(0.01));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.entries()[0].kind, TransactionType::Sell);
        assert_eq!(batch.net_change(usd.id), dec!(-250));
        assert_eq!(batch.net_change(btc.id), dec!(0.01));
    }

    #[test]
    fn test_opposite_trades_lock_in_the_same_order() {
        let usd = Wallet::new(UserId::new(1), Currency::usd());
        let btc = Wallet::new(UserId::new(1), Currency::btc());

        let mut buy = TransactionBatch::new();
        buy.add_entry(&usd, TransactionType::Sell, dec!(-250));
        buy.add_entry(&btc, TransactionType::Buy, dec!(0.01));

        let mut sell = TransactionBatch::new();
        sell.add_entry(&btc, TransactionType::Sell, dec!(-0.01));
        sell.add_entry(&usd, TransactionType::Buy, dec!(250));
        sell.add_entry(&usd, TransactionType::Deposit, dec!(1));

        assert_eq!(buy.wallet_ids(), sell.wallet_ids());
        assert_eq!(sell.wallet_ids().len(), 2);
    }
}
