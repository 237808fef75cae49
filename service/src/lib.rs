//! TradeWallet Service
//!
//! The trading orchestrator sits between callers, the rate cache and the
//! ledger. It validates requests, prices trades against the current rate
//! snapshot, prevents overdrafts under per-wallet locks and commits both
//! legs of a trade together.

pub mod config;
pub mod locks;
pub mod service;
pub mod state;
pub mod trading;

pub use config::{LogFormat, RateConfig, ServiceConfig, TradingConfig};
pub use locks::{WalletGuard, WalletLocks};
pub use service::WalletService;
pub use state::ServiceState;
pub use trading::{InsufficientBalance, Outcome, Receipt, TradeReceipt, TradingService};
