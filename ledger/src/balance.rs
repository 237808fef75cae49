//! Ledger audit: does the history explain the balance?

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradewallet_common::WalletId;

use crate::error::{LedgerError, LedgerResult};
use crate::transaction::Transaction;
use crate::wallet::Wallet;

/// Result of replaying a wallet's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub wallet_id: WalletId,
    /// Balance stored on the wallet.
    pub balance: Decimal,
    /// Sum of every `change` in the history.
    pub replayed: Decimal,
    /// `balance` of the latest transaction, if any.
    pub latest: Option<Decimal>,
    /// Number of transactions replayed.
    pub transactions: usize,
    /// Problems found, in history order.
    pub violations: Vec<String>,
}

impl LedgerAudit {
    /// Replay `history` (ordered by sequence) against `wallet`.
    pub fn check(wallet: &Wallet, history: &[Transaction]) -> Self {
        let mut violations = Vec::new();
        let mut running = Decimal::ZERO;

        for (index, tx) in history.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            if tx.sequence != expected_sequence {
                violations.push(format!(
                    "transaction {} has sequence {}, expected {}",
                    tx.id, tx.sequence, expected_sequence
                ));
            }

            running += tx.change;
            if tx.balance != running {
                violations.push(format!(
                    "transaction {} records balance {}, prefix sum is {}",
                    tx.id, tx.balance, running
                ));
            }
        }

        if running != wallet.balance {
            violations.push(format!(
                "wallet balance {} differs from replayed history {}",
                wallet.balance, running
            ));
        }

        if history.len() as u64 != wallet.version {
            violations.push(format!(
                "wallet version {} but {} transactions recorded",
                wallet.version,
                history.len()
            ));
        }

        Self {
            wallet_id: wallet.id,
            balance: wallet.balance,
            replayed: running,
            latest: history.last().map(|tx| tx.balance),
            transactions: history.len(),
            violations,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn a failed audit into an error.
    pub fn into_result(self) -> LedgerResult<Self> {
        if self.is_consistent() {
            Ok(self)
        } else {
            Err(LedgerError::IntegrityViolation {
                wallet_id: self.wallet_id,
                reason: self.violations.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;
    use rust_decimal_macros::dec;
    use tradewallet_common::{Currency, UserId};

    fn replay(changes: &[(TransactionType, Decimal)]) -> (Wallet, Vec<Transaction>) {
        let mut wallet = Wallet::new(UserId::new(1), Currency::usd());
        let mut history = Vec::new();
        for (kind, change) in changes {
            let tx = Transaction::next(&wallet, *kind, *change).unwrap();
            wallet.balance = tx.balance;
            wallet.version = tx.sequence;
            history.push(tx);
        }
        (wallet, history)
    }

    #[test]
    fn test_consistent_history() {
        let (wallet, history) = replay(&[
            (TransactionType::Deposit, dec!(100)),
            (TransactionType::Deposit, dec!(300)),
            (TransactionType::Sell, dec!(-250)),
        ]);

        let audit = LedgerAudit::check(&wallet, &history);

        assert!(audit.is_consistent(), "{:?}", audit.violations);
        assert_eq!(audit.replayed, dec!(150));
        assert_eq!(audit.latest, Some(dec!(150)));
    }

    #[test]
    fn test_orphaned_transaction_detected() {
        let (wallet, mut history) = replay(&[(TransactionType::Deposit, dec!(100))]);
        history.push(Transaction::next(&wallet, TransactionType::Withdraw, dec!(-40)).unwrap());

        let audit = LedgerAudit::check(&wallet, &history);

        assert!(!audit.is_consistent());
        assert!(matches!(
            audit.into_result(),
            Err(LedgerError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_empty_wallet_is_consistent() {
        let wallet = Wallet::new(UserId::new(1), Currency::btc());
        let audit = LedgerAudit::check(&wallet, &[]);

        assert!(audit.is_consistent());
        assert_eq!(audit.latest, None);
    }
}
