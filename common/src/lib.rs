//! TradeWallet Common Types
//!
//! Shared types used across the wallet service: wallet and transaction
//! identifiers, currency and money values, timing defaults and the
//! caller-facing error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
