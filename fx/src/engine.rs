//! Background refresh and broadcast of exchange rates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use tradewallet_common::{constants, limits, Currency};

use crate::broadcaster::{BroadcastReport, Broadcaster};
use crate::cache::RateCache;
use crate::error::{FetchError, FetchResult};
use crate::provider::RateProvider;

/// Configuration for the rate engine.
#[derive(Debug, Clone)]
pub struct RateEngineConfig {
    /// Currency every rate is quoted against.
    pub base_currency: Currency,
    /// Time between upstream fetches.
    pub refresh_interval: Duration,
    /// Time between subscriber pushes.
    pub broadcast_interval: Duration,
    /// Upper bound for a single fetch.
    pub fetch_timeout: Duration,
    /// Pending snapshots per subscriber queue.
    pub subscriber_buffer: usize,
}

impl Default for RateEngineConfig {
    fn default() -> Self {
        Self {
            base_currency: Currency::usd(),
            refresh_interval: constants::rate_refresh_interval(),
            broadcast_interval: constants::rate_broadcast_interval(),
            fetch_timeout: constants::rate_fetch_timeout(),
            subscriber_buffer: limits::SUBSCRIBER_BUFFER,
        }
    }
}

/// Owns the rate cache and drives its two schedules.
pub struct RateEngine {
    provider: Arc<dyn RateProvider>,
    cache: Arc<RateCache>,
    broadcaster: Arc<Broadcaster>,
    config: RateEngineConfig,
}

impl RateEngine {
    /// Create a new engine around `provider`.
    pub fn new(provider: Arc<dyn RateProvider>, config: RateEngineConfig) -> Self {
        Self {
            provider,
            cache: Arc::new(RateCache::new()),
            broadcaster: Arc::new(Broadcaster::new(config.subscriber_buffer)),
            config,
        }
    }

    /// Shared handle to the snapshot cache.
    pub fn cache(&self) -> Arc<RateCache> {
        Arc::clone(&self.cache)
    }

    /// Shared handle to the subscriber registry.
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn config(&self) -> &RateEngineConfig {
        &self.config
    }

    /// Fetch once and swap the result into the cache.
    ///
    /// On failure the previous snapshot stays in place.
    #[instrument(skip(self), fields(base = %self.config.base_currency, provider = self.provider.name()))]
    pub async fn refresh_once(&self) -> FetchResult<()> {
        let fetch = self.provider.fetch(&self.config.base_currency);

        let result = match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(
                self.config.fetch_timeout.as_millis() as u64,
            )),
        };

        match result {
            Ok(snapshot) => {
                let rates = snapshot.len();
                self.cache.replace(snapshot);
                debug!(rates, "Exchange rates refreshed");
                Ok(())
            }
            Err(e) => {
                self.cache.record_failure();
                warn!(
                    error = %e,
                    stale = self.cache.is_ready(),
                    "Failed to fetch exchange rates"
                );
                Err(e)
            }
        }
    }

    /// Push the current snapshot to every subscriber; `None` if not ready.
    pub fn broadcast_once(&self) -> Option<BroadcastReport> {
        let snapshot = self.cache.get_rates()?;
        let report = self.broadcaster.broadcast(&snapshot);
        if report.lagged > 0 || report.closed > 0 {
            debug!(
                delivered = report.delivered,
                lagged = report.lagged,
                closed = report.closed,
                "Broadcast round finished"
            );
        }
        Some(report)
    }

    /// Start the refresh and broadcast loops as independent tasks.
    ///
    /// The first refresh runs immediately; the first broadcast happens one
    /// broadcast interval later.
    pub fn spawn(self: Arc<Self>) -> RateEngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            base = %self.config.base_currency,
            refresh_secs = self.config.refresh_interval.as_secs(),
            broadcast_secs = self.config.broadcast_interval.as_secs(),
            "Starting rate engine"
        );

        let refresh = tokio::spawn(Arc::clone(&self).run_refresh_loop(shutdown_rx.clone()));
        let broadcast = tokio::spawn(self.run_broadcast_loop(shutdown_rx));

        RateEngineHandle {
            shutdown: shutdown_tx,
            tasks: vec![refresh, broadcast],
        }
    }

    async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.refresh_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Rate refresh loop stopped");
    }

    async fn run_broadcast_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.broadcast_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast_once();
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Rate broadcast loop stopped");
    }
}

/// Handle to the running loops.
pub struct RateEngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RateEngineHandle {
    /// Signal both loops to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Rate engine task ended abnormally");
            }
        }

        info!("Rate engine stopped");
    }

    /// Whether every loop has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }
}
