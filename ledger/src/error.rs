//! Ledger error types.

use rust_decimal::Decimal;
use thiserror::Error;
use tradewallet_common::{TransactionId, WalletError, WalletId};

/// Errors raised by wallet storage and the ledger engine.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Wallet is unknown to the store (never created).
    #[error("Invalid wallet: {0}")]
    InvalidWallet(String),

    /// Transaction type code outside the supported set.
    #[error("Invalid transaction type: {0}")]
    InvalidTransactionType(i16),

    /// Wallet changed since it was read.
    #[error("Wallet {wallet_id} changed concurrently: expected version {expected}, found {actual}")]
    WalletConflict {
        wallet_id: WalletId,
        expected: u64,
        actual: u64,
    },

    /// Applying the change would overflow the wallet balance.
    #[error("Balance of wallet {wallet_id} cannot absorb a change of {change}")]
    BalanceOverflow { wallet_id: WalletId, change: Decimal },

    /// The database aborted the write because of a concurrent writer
    /// (deadlock, serialization failure or a duplicate sequence).
    #[error("Storage contention: {0}")]
    Contention(String),

    /// Underlying storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A compensating removal failed; the wallet now has an orphaned transaction.
    #[error("Compensation failed for transaction {transaction_id}: {reason}")]
    CompensationFailed {
        transaction_id: TransactionId,
        reason: String,
    },

    /// A multi-leg write stopped after some legs were applied.
    #[error("Batch stopped after {applied} of {total} legs: {reason}")]
    PartialBatch {
        applied: usize,
        total: usize,
        reason: String,
    },

    /// Stored history does not explain the stored balance.
    #[error("Ledger integrity violation on wallet {wallet_id}: {reason}")]
    IntegrityViolation { wallet_id: WalletId, reason: String },
}

impl LedgerError {
    /// Only concurrent writers can be outrun by a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::WalletConflict { .. } | LedgerError::Contention(_)
        )
    }
}

/// Postgres codes for a deadlock and a serialization failure.
const CONTENTION_CODES: [&str; 2] = ["40P01", "40001"];
const UNIQUE_VIOLATION: &str = "23505";
/// Unique constraint on `transactions (wallet_id, sequence)`.
const SEQUENCE_CONSTRAINT: &str = "transactions_wallet_id_sequence_key";

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code();
            let code = code.as_deref();
            let duplicate_sequence =
                code == Some(UNIQUE_VIOLATION) && db.constraint() == Some(SEQUENCE_CONSTRAINT);

            if duplicate_sequence || code.is_some_and(|c| CONTENTION_CODES.contains(&c)) {
                return LedgerError::Contention(db.message().to_string());
            }
        }
        LedgerError::Storage(err.to_string())
    }
}

impl From<LedgerError> for WalletError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidWallet(w) => WalletError::InvalidWallet(w),
            LedgerError::InvalidTransactionType(code) => WalletError::InvalidTransactionType(code),
            e @ (LedgerError::WalletConflict { .. } | LedgerError::Contention(_)) => {
                WalletError::Conflict(e.to_string())
            }
            e @ LedgerError::BalanceOverflow { .. } => WalletError::InvalidAmount(e.to_string()),
            LedgerError::Storage(msg) => WalletError::Storage(msg),
            e @ (LedgerError::CompensationFailed { .. }
            | LedgerError::PartialBatch { .. }
            | LedgerError::IntegrityViolation { .. }) => WalletError::Inconsistent(e.to_string()),
        }
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::fmt;

    #[derive(Debug)]
    struct PgFailure {
        code: &'static str,
        constraint: Option<&'static str>,
    }

    impl fmt::Display for PgFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "postgres error {}", self.code)
        }
    }

    impl std::error::Error for PgFailure {}

    impl sqlx::error::DatabaseError for PgFailure {
        fn message(&self) -> &str {
            "postgres error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.code {
                UNIQUE_VIOLATION => sqlx::error::ErrorKind::UniqueViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    fn from_pg(code: &'static str, constraint: Option<&'static str>) -> LedgerError {
        LedgerError::from(sqlx::Error::Database(Box::new(PgFailure { code, constraint })))
    }

    #[test]
    fn test_deadlock_and_serialization_failure_are_retryable() {
        for code in ["40P01", "40001"] {
            let err = from_pg(code, None);
            assert!(matches!(err, LedgerError::Contention(_)), "{}", code);
            assert!(err.is_retryable());
            assert!(matches!(WalletError::from(err), WalletError::Conflict(_)));
        }
    }

    #[test]
    fn test_duplicate_sequence_is_retryable() {
        let err = from_pg(UNIQUE_VIOLATION, Some(SEQUENCE_CONSTRAINT));
        assert!(err.is_retryable());

        let other = from_pg(UNIQUE_VIOLATION, Some("wallets_pkey"));
        assert!(matches!(other, LedgerError::Storage(_)));
        assert!(!other.is_retryable());
    }

    #[test]
    fn test_other_sqlx_errors_are_storage() {
        let err = LedgerError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, LedgerError::Storage(_)));
        assert!(WalletError::from(err).is_internal());
    }

    #[test]
    fn test_balance_overflow_is_an_amount_error() {
        let err = LedgerError::BalanceOverflow {
            wallet_id: WalletId::new(),
            change: Decimal::MAX,
        };

        assert!(!err.is_retryable());
        let err = WalletError::from(err);
        assert!(matches!(err, WalletError::InvalidAmount(_)));
        assert!(!err.is_internal());
    }
}
