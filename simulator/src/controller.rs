//! Simulation controller.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use tradewallet_common::Currency;
use tradewallet_fx::FixedRateProvider;
use tradewallet_ledger::{InMemoryWalletStore, StoreFault, WriteMode};
use tradewallet_service::{ServiceConfig, WalletService};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Expected, FaultType, Scenario, ScenarioStep};
use crate::trader::{OpResult, SimulatedTrader, TradeOp, TraderFactory};

/// Units of each market currency per unit of USD.
fn market_rates() -> [(&'static str, Decimal); 3] {
    [
        ("BTC", Decimal::new(4, 5)),
        ("ETH", Decimal::new(5, 4)),
        ("EUR", Decimal::new(92, 2)),
    ]
}

/// Totals from auditing every simulated wallet.
#[derive(Debug, Clone, Default)]
pub struct AuditSummary {
    pub wallets: usize,
    pub transactions: usize,
    pub violations: Vec<String>,
}

impl AuditSummary {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Controls the simulation.
pub struct SimulationController {
    service: Arc<WalletService>,
    store: Arc<InMemoryWalletStore>,
    provider: Arc<FixedRateProvider>,
    traders: Arc<Vec<SimulatedTrader>>,
    markets: Arc<Vec<Currency>>,
    /// Random number generator.
    rng: Arc<Mutex<StdRng>>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Result of the last scenario operation.
    last: Option<Expected>,
}

impl SimulationController {
    /// Create a new simulation controller over an in-memory store.
    pub fn new(trader_count: usize, seed: Option<u64>, write_mode: WriteMode) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let mut config = ServiceConfig::default();
        config.trading.write_mode = write_mode;

        let store = Arc::new(InMemoryWalletStore::new());
        let provider = Arc::new(FixedRateProvider::with_rates("simulator", market_rates()));
        let service = Arc::new(WalletService::new(config, store.clone(), provider.clone()));
        let markets = market_rates()
            .iter()
            .map(|(code, _)| Currency::new(*code))
            .collect();

        Self {
            service,
            store,
            provider,
            traders: Arc::new(TraderFactory::create_traders(trader_count)),
            markets: Arc::new(markets),
            rng: Arc::new(Mutex::new(rng)),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            last: None,
        }
    }

    /// Start the service and wait for the first rate snapshot.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!(traders = self.traders.len(), "Initializing simulation");

        self.service.start().await?;
        if !self.service.wait_for_rates(Duration::from_secs(5)).await {
            bail!("Rates did not load within 5s");
        }

        Ok(())
    }

    /// Run a scenario, failing on the first unmet assertion.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        if self.traders.len() < scenario.traders {
            bail!(
                "Scenario {} needs {} traders, simulation has {}",
                scenario.name,
                scenario.traders,
                self.traders.len()
            );
        }

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("{} step {}: {:?}", scenario.name, index + 1, step))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Issue `operations` random operations from `concurrency` workers.
    pub async fn run(&self, operations: usize, concurrency: usize) -> anyhow::Result<Duration> {
        if self.traders.is_empty() {
            bail!("Random load needs at least one trader");
        }

        info!(operations, concurrency, "Running random load");
        let started = Instant::now();
        let issued = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..concurrency.max(1))
            .map(|_| {
                let service = self.service.clone();
                let traders = self.traders.clone();
                let markets = self.markets.clone();
                let rng = self.rng.clone();
                let metrics = self.metrics.clone();
                let issued = issued.clone();

                tokio::spawn(async move {
                    while issued.fetch_add(1, Ordering::Relaxed) < operations {
                        let (trader, op) = {
                            let mut rng = rng.lock().await;
                            let trader = traders[rng.gen_range(0..traders.len())].clone();
                            (trader, TradeOp::random(&mut *rng, &markets))
                        };

                        let op_started = Instant::now();
                        let result = trader.execute(&service, &op).await;
                        record(&metrics, &trader, &op, &result, op_started.elapsed()).await;
                    }
                })
            })
            .collect();

        for joined in join_all(workers).await {
            joined?;
        }

        Ok(started.elapsed())
    }

    /// Replay every wallet the traders own.
    pub async fn audit(&self) -> anyhow::Result<AuditSummary> {
        let ledger = self.service.ledger();
        let mut summary = AuditSummary::default();

        for trader in self.traders.iter() {
            for wallet in ledger.store().list_wallets(trader.id).await? {
                let audit = ledger.verify_wallet(wallet.id).await?;
                summary.wallets += 1;
                summary.transactions += audit.transactions;

                if wallet.balance < Decimal::ZERO {
                    summary.violations.push(format!(
                        "{} {} is negative: {}",
                        trader.name, wallet.currency, wallet.balance
                    ));
                }
                for violation in audit.violations {
                    summary
                        .violations
                        .push(format!("{} {}: {}", trader.name, wallet.currency, violation));
                }
            }
        }

        debug!(
            wallets = summary.wallets,
            stored = self.store.wallet_count(),
            "Audit complete"
        );
        Ok(summary)
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Stop the wallet service.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.service.stop().await?;
        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Deposit { trader, amount } => {
                self.issue(*trader, TradeOp::Deposit(parse_amount(amount)?)).await?;
            }
            ScenarioStep::Withdraw { trader, amount } => {
                self.issue(*trader, TradeOp::Withdraw(parse_amount(amount)?)).await?;
            }
            ScenarioStep::Buy {
                trader,
                currency,
                amount,
            } => {
                let op = TradeOp::Buy {
                    currency: Currency::new(currency.as_str()),
                    amount: parse_amount(amount)?,
                };
                self.issue(*trader, op).await?;
            }
            ScenarioStep::Sell {
                trader,
                currency,
                amount,
            } => {
                let op = TradeOp::Sell {
                    currency: Currency::new(currency.as_str()),
                    amount: parse_amount(amount)?,
                };
                self.issue(*trader, op).await?;
            }
            ScenarioStep::ConcurrentBuys {
                trader,
                currency,
                amount,
                count,
            } => {
                let trader = self.trader(*trader)?.clone();
                let op = TradeOp::Buy {
                    currency: Currency::new(currency.as_str()),
                    amount: parse_amount(amount)?,
                };
                self.concurrent(trader, op, *count).await?;
                self.last = None;
            }
            ScenarioStep::RefreshRates => {
                if let Err(e) = self.service.refresh_rates().await {
                    warn!(error = %e, "Rate refresh failed");
                }
            }
            ScenarioStep::InjectFault { fault_type } => {
                info!(?fault_type, "Injecting fault");
                match fault_type {
                    FaultType::StorageWrite => {
                        self.store.inject_fault(StoreFault::FailNextSave);
                        self.store.inject_fault(StoreFault::FailNextCommit);
                    }
                    FaultType::UpstreamOutage => self.provider.set_available(false),
                }
            }
            ScenarioStep::ClearFault { fault_type } => {
                info!(?fault_type, "Clearing fault");
                match fault_type {
                    FaultType::StorageWrite => self.store.clear_faults(),
                    FaultType::UpstreamOutage => self.provider.set_available(true),
                }
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    async fn issue(&mut self, index: usize, op: TradeOp) -> anyhow::Result<()> {
        let trader = self.trader(index)?.clone();

        let started = Instant::now();
        let result = trader.execute(&self.service, &op).await;
        record(&self.metrics, &trader, &op, &result, started.elapsed()).await;

        self.last = Some(match result {
            OpResult::Completed => Expected::Completed,
            OpResult::Declined => Expected::Declined,
            OpResult::Failed(_) => Expected::Failed,
        });
        Ok(())
    }

    async fn concurrent(
        &self,
        trader: SimulatedTrader,
        op: TradeOp,
        count: usize,
    ) -> anyhow::Result<()> {
        let tasks: Vec<_> = (0..count)
            .map(|_| {
                let service = self.service.clone();
                let metrics = self.metrics.clone();
                let trader = trader.clone();
                let op = op.clone();

                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = trader.execute(&service, &op).await;
                    record(&metrics, &trader, &op, &result, started.elapsed()).await;
                    matches!(result, OpResult::Completed)
                })
            })
            .collect();

        let mut completed = 0;
        for joined in join_all(tasks).await {
            if joined? {
                completed += 1;
            }
        }

        info!(trader = %trader.name, %op, count, completed, "Concurrent operations finished");
        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::LastOperation { expected } => {
                if self.last != Some(*expected) {
                    bail!("Expected last operation {:?}, got {:?}", expected, self.last);
                }
            }
            AssertCondition::BalanceEquals {
                trader,
                currency,
                amount,
            } => {
                let trader = self.trader(*trader)?;
                let expected = parse_amount(amount)?;
                let balances = self.service.balances(trader.id).await?;
                let actual = balances
                    .get(&Currency::new(currency.as_str()))
                    .copied()
                    .unwrap_or(Decimal::ZERO);

                if actual != expected {
                    bail!(
                        "{} {} balance is {}, expected {}",
                        trader.name,
                        currency,
                        actual,
                        expected
                    );
                }
            }
            AssertCondition::TransactionCount {
                trader,
                currency,
                count,
            } => {
                let trader = self.trader(*trader)?;
                let history = self
                    .service
                    .history(trader.id, &Currency::new(currency.as_str()))
                    .await?;

                if history.len() != *count {
                    bail!(
                        "{} {} has {} transactions, expected {}",
                        trader.name,
                        currency,
                        history.len(),
                        count
                    );
                }
            }
            AssertCondition::RatesAvailable => {
                self.service.rates()?;
            }
            AssertCondition::LedgerConsistent => {
                let summary = self.audit().await?;
                if !summary.is_clean() {
                    bail!("Ledger inconsistent: {}", summary.violations.join("; "));
                }
            }
        }

        Ok(())
    }

    fn trader(&self, index: usize) -> anyhow::Result<&SimulatedTrader> {
        self.traders
            .get(index)
            .ok_or_else(|| anyhow!("No trader at index {}", index))
    }
}

fn parse_amount(amount: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(amount).with_context(|| format!("Invalid amount: {}", amount))
}

async fn record(
    metrics: &RwLock<SimulationMetrics>,
    trader: &SimulatedTrader,
    op: &TradeOp,
    result: &OpResult,
    elapsed: Duration,
) {
    let latency_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
    let mut metrics = metrics.write().await;

    match result {
        OpResult::Completed => metrics.record_completed(latency_us),
        OpResult::Declined => {
            debug!(trader = %trader.name, %op, "Declined");
            metrics.record_declined(latency_us);
        }
        OpResult::Failed(e) => {
            warn!(trader = %trader.name, %op, error = %e, "Operation failed");
            metrics.record_failure();
        }
    }
}
