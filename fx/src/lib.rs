//! TradeWallet FX
//!
//! Market data for the wallet service: fetches exchange rates from an
//! upstream API, keeps the last good snapshot for synchronous readers and
//! pushes it to any number of asynchronous subscribers.
//!
//! # Features
//!
//! - Pluggable rate providers (HTTP upstream, fixed table)
//! - Snapshot cache replaced wholesale on every successful refresh
//! - Non-blocking fan-out to bounded per-subscriber queues
//! - Independent refresh and broadcast schedules
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tradewallet_fx::{HttpRateProvider, RateEngine, RateEngineConfig};
//!
//! let provider = Arc::new(HttpRateProvider::new(url, timeout)?);
//! let engine = Arc::new(RateEngine::new(provider, RateEngineConfig::default()));
//! let handle = engine.clone().spawn();
//!
//! let mut feed = engine.broadcaster().subscribe();
//! while let Some(snapshot) = feed.recv().await {
//!     println!("{}", snapshot.to_json()?);
//! }
//! ```

pub mod snapshot;
pub mod provider;
pub mod cache;
pub mod broadcaster;
pub mod engine;
pub mod conversion;
pub mod error;

pub use snapshot::ExchangeRateSnapshot;
pub use provider::{FixedRateProvider, HttpRateProvider, RateProvider};
pub use cache::RateCache;
pub use broadcaster::{BroadcastReport, Broadcaster, SubscriberId, Subscription};
pub use engine::{RateEngine, RateEngineConfig, RateEngineHandle};
pub use conversion::Conversion;
pub use error::{FetchError, FetchResult};
