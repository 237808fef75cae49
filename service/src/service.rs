//! Wallet service lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use tradewallet_common::{constants, Currency, Result, UserId, WalletError};
use tradewallet_fx::{
    ExchangeRateSnapshot, FetchResult, RateCache, RateEngine, RateEngineHandle, RateProvider,
    Subscription,
};
use tradewallet_ledger::{LedgerEngine, Transaction, WalletStore};

use crate::config::ServiceConfig;
use crate::locks::WalletLocks;
use crate::state::ServiceState;
use crate::trading::{Outcome, Receipt, TradeReceipt, TradingService};

struct BackgroundTasks {
    rates: RateEngineHandle,
    prune: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Composes the rate engine and the trading orchestrator.
pub struct WalletService {
    config: ServiceConfig,
    state: Arc<RwLock<ServiceState>>,
    rate_engine: Arc<RateEngine>,
    trading: Arc<TradingService>,
    locks: Arc<WalletLocks>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl WalletService {
    /// Create a new wallet service instance.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn WalletStore>,
        provider: Arc<dyn RateProvider>,
    ) -> Self {
        let rate_engine = Arc::new(RateEngine::new(provider, config.rates.engine_config()));
        let ledger = Arc::new(LedgerEngine::new(store, config.trading.write_mode));
        let locks = Arc::new(WalletLocks::new());
        let trading = Arc::new(TradingService::new(
            ledger,
            rate_engine.cache(),
            locks.clone(),
            config.rates.base_currency.clone(),
            config.trading.max_attempts,
        ));

        Self {
            config,
            state: Arc::new(RwLock::new(ServiceState::Starting)),
            rate_engine,
            trading,
            locks,
            tasks: Mutex::new(None),
        }
    }

    /// Start the rate loops and lock pruning.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Ok(());
        }

        info!(
            base = %self.config.rates.base_currency,
            write_mode = %self.config.trading.write_mode,
            "Starting wallet service"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rates = Arc::clone(&self.rate_engine).spawn();
        let prune = tokio::spawn(run_prune_loop(
            Arc::clone(&self.locks),
            self.config.trading.lock_prune_interval,
            shutdown_rx,
        ));

        *tasks = Some(BackgroundTasks {
            rates,
            prune,
            shutdown: shutdown_tx,
        });
        *self.state.write() = ServiceState::Running;

        info!("Wallet service started");
        Ok(())
    }

    /// Stop background tasks gracefully.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping wallet service");
        *self.state.write() = ServiceState::ShuttingDown;

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            let drain = async {
                tasks.rates.shutdown().await;
                if let Err(e) = tasks.prune.await {
                    warn!(error = %e, "Lock pruning task ended abnormally");
                }
            };
            if tokio::time::timeout(constants::shutdown_timeout(), drain).await.is_err() {
                warn!("Background tasks did not stop in time");
            }
        }

        *self.state.write() = ServiceState::Stopped;
        info!("Wallet service stopped");
        Ok(())
    }

    /// Get the current service state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Check if the service is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn trading(&self) -> &Arc<TradingService> {
        &self.trading
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        self.trading.ledger()
    }

    pub fn rate_cache(&self) -> Arc<RateCache> {
        self.rate_engine.cache()
    }

    /// Register for periodic rate pushes.
    pub fn subscribe_rates(&self) -> Subscription {
        self.rate_engine.broadcaster().subscribe()
    }

    /// Fetch rates now instead of waiting for the next tick.
    pub async fn refresh_rates(&self) -> FetchResult<()> {
        self.rate_engine.refresh_once().await
    }

    /// Wait until the first snapshot is loaded; `false` on timeout.
    pub async fn wait_for_rates(&self, timeout: Duration) -> bool {
        let cache = self.rate_engine.cache();
        let ready = async {
            while !cache.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, ready).await.is_ok()
    }

    pub async fn deposit(&self, owner: UserId, amount: Decimal) -> Result<Receipt> {
        self.ensure_running()?;
        self.trading.deposit(owner, amount).await
    }

    pub async fn withdraw(&self, owner: UserId, amount: Decimal) -> Result<Outcome<Receipt>> {
        self.ensure_running()?;
        self.trading.withdraw(owner, amount).await
    }

    pub async fn buy(
        &self,
        owner: UserId,
        currency: &Currency,
        amount: Decimal,
    ) -> Result<Outcome<TradeReceipt>> {
        self.ensure_running()?;
        self.trading.buy(owner, currency, amount).await
    }

    pub async fn sell(
        &self,
        owner: UserId,
        currency: &Currency,
        amount: Decimal,
    ) -> Result<Outcome<TradeReceipt>> {
        self.ensure_running()?;
        self.trading.sell(owner, currency, amount).await
    }

    pub async fn balances(&self, owner: UserId) -> Result<BTreeMap<Currency, Decimal>> {
        self.ensure_running()?;
        self.trading.balances(owner).await
    }

    pub fn rates(&self) -> Result<Arc<ExchangeRateSnapshot>> {
        self.ensure_running()?;
        self.trading.rates()
    }

    pub async fn history(&self, owner: UserId, currency: &Currency) -> Result<Vec<Transaction>> {
        self.ensure_running()?;
        self.trading.history(owner, currency).await
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_accepting_requests() {
            return Err(WalletError::ServiceUnavailable {
                retry_after_ms: 1000,
            });
        }
        Ok(())
    }
}

async fn run_prune_loop(
    locks: Arc<WalletLocks>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                locks.prune_idle();
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Lock pruning loop stopped");
}
