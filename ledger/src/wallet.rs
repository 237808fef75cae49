//! Wallet definitions for the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradewallet_common::{Currency, Money, UserId, WalletId, WalletKey};

/// A per-owner, per-currency balance.
///
/// `version` starts at zero and is bumped by every persisted change; it is
/// also the sequence number of the wallet's latest transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Unique wallet identifier.
    pub id: WalletId,
    /// Owning user.
    pub owner: UserId,
    /// Wallet currency.
    pub currency: Currency,
    /// Current balance.
    pub balance: Decimal,
    /// Optimistic concurrency version.
    pub version: u64,
    /// When the wallet was created.
    pub created_at: DateTime<Utc>,
    /// When the wallet was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create a new zero-balance wallet.
    pub fn new(owner: UserId, currency: Currency) -> Self {
        let now = Utc::now();

        Self {
            id: WalletId::new(),
            owner,
            currency,
            balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key of this wallet.
    pub fn key(&self) -> WalletKey {
        WalletKey::new(self.owner, self.currency.clone())
    }

    /// Balance as money.
    pub fn money(&self) -> Money {
        Money::new(self.balance, self.currency.clone())
    }

    /// Check if the wallet can cover `amount`.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_wallet_is_empty() {
        let wallet = Wallet::new(UserId::new(7), Currency::btc());

        assert_eq!(wallet.balance, Decimal::ZERO);
        assert_eq!(wallet.version, 0);
        assert_eq!(wallet.key().to_string(), "7:BTC");
        assert!(wallet.has_sufficient_funds(Decimal::ZERO));
        assert!(!wallet.has_sufficient_funds(dec!(0.01)));
    }
}
