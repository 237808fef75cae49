//! Error types surfaced to callers of the wallet service.

use crate::Currency;
use thiserror::Error;

/// Main error type for wallet service operations.
///
/// Insufficient balance is deliberately absent: a declined trade is a
/// successful outcome carrying a false status flag, not an error.
#[derive(Error, Debug)]
pub enum WalletError {
    /// Currency not present in the current rate table.
    #[error("Currency not found: {0}")]
    CurrencyNotFound(Currency),

    /// Amount is zero, negative or otherwise unusable.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed currency code or unsupported pairing.
    #[error("Invalid currency: {0}")]
    InvalidCurrency(String),

    /// No exchange-rate snapshot has been fetched yet.
    #[error("Exchange rates are not available yet")]
    RatesNotReady,

    /// Wallet is unknown to the store.
    #[error("Invalid wallet: {0}")]
    InvalidWallet(String),

    /// Transaction type outside the supported set.
    #[error("Invalid transaction type: {0}")]
    InvalidTransactionType(i16),

    /// Concurrent writers kept invalidating the balance that was read.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    /// Storage unavailable or failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The ledger could not be restored after a partial write.
    #[error("Ledger inconsistency: {0}")]
    Inconsistent(String),

    /// Service is not running.
    #[error("Service unavailable, retry after {retry_after_ms}ms")]
    ServiceUnavailable { retry_after_ms: u64 },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::RatesNotReady
                | WalletError::Conflict(_)
                | WalletError::ServiceUnavailable { .. }
                | WalletError::Storage(_)
        )
    }

    /// Errors caused by the caller's input (400-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WalletError::CurrencyNotFound(_)
                | WalletError::InvalidAmount(_)
                | WalletError::InvalidCurrency(_)
        )
    }

    /// Errors that must be logged and hidden behind an opaque message.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            WalletError::InvalidWallet(_)
                | WalletError::InvalidTransactionType(_)
                | WalletError::Storage(_)
                | WalletError::Inconsistent(_)
                | WalletError::Internal(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::CurrencyNotFound(_) => "CURRENCY_NOT_FOUND",
            WalletError::InvalidAmount(_) => "INVALID_AMOUNT",
            WalletError::InvalidCurrency(_) => "INVALID_CURRENCY",
            WalletError::RatesNotReady => "RATES_NOT_READY",
            WalletError::InvalidWallet(_) => "INVALID_WALLET",
            WalletError::InvalidTransactionType(_) => "INVALID_TRANSACTION_TYPE",
            WalletError::Conflict(_) => "CONFLICT",
            WalletError::Storage(_) => "STORAGE_ERROR",
            WalletError::Inconsistent(_) => "LEDGER_INCONSISTENT",
            WalletError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            WalletError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to a client.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Result type alias for wallet service operations.
pub type Result<T> = std::result::Result<T, WalletError>;
