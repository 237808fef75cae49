//! TradeWallet Ledger
//!
//! Per-(owner, currency) wallets whose balance is explained by an
//! append-only transaction history. Balance and history are written
//! together through [`WalletStore::commit`], guarded by an optimistic
//! wallet version.

pub mod error;
pub mod wallet;
pub mod transaction;
pub mod balance;
pub mod store;
pub mod memory;
pub mod postgres;
pub mod engine;

pub use error::{LedgerError, LedgerResult};
pub use wallet::Wallet;
pub use transaction::{LedgerEntry, Transaction, TransactionBatch, TransactionType};
pub use balance::LedgerAudit;
pub use store::WalletStore;
pub use memory::{InMemoryWalletStore, StoreFault};
pub use postgres::PgWalletStore;
pub use engine::{LedgerEngine, WriteMode};
