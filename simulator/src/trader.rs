//! Simulated traders and the operations they issue.

use std::fmt;

use rand::Rng;
use rust_decimal::Decimal;
use tradewallet_common::{Currency, UserId, WalletError};
use tradewallet_service::WalletService;

/// A simulated wallet owner.
#[derive(Debug, Clone)]
pub struct SimulatedTrader {
    /// Owner id used for every wallet of this trader.
    pub id: UserId,
    /// Display name.
    pub name: String,
}

/// One request against the wallet service.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOp {
    Deposit(Decimal),
    Withdraw(Decimal),
    Buy { currency: Currency, amount: Decimal },
    Sell { currency: Currency, amount: Decimal },
}

impl TradeOp {
    /// Draw a random operation over `markets`.
    ///
    /// Deposits are weighted up so that wallets carry enough funds for
    /// trades to complete as well as decline.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, markets: &[Currency]) -> Self {
        let roll = rng.gen_range(0..10);
        if markets.is_empty() || roll < 3 {
            return TradeOp::Deposit(Decimal::from(rng.gen_range(10..1_000)));
        }
        if roll == 3 {
            return TradeOp::Withdraw(Decimal::from(rng.gen_range(10..500)));
        }

        let currency = markets[rng.gen_range(0..markets.len())].clone();
        let amount = Decimal::new(rng.gen_range(1..200), 4);
        if roll < 7 {
            TradeOp::Buy { currency, amount }
        } else {
            TradeOp::Sell { currency, amount }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TradeOp::Deposit(_) => "deposit",
            TradeOp::Withdraw(_) => "withdraw",
            TradeOp::Buy { .. } => "buy",
            TradeOp::Sell { .. } => "sell",
        }
    }
}

impl fmt::Display for TradeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOp::Deposit(amount) | TradeOp::Withdraw(amount) => {
                write!(f, "{} {}", self.name(), amount)
            }
            TradeOp::Buy { currency, amount } | TradeOp::Sell { currency, amount } => {
                write!(f, "{} {} {}", self.name(), amount, currency)
            }
        }
    }
}

/// What happened to an operation.
#[derive(Debug)]
pub enum OpResult {
    Completed,
    Declined,
    Failed(WalletError),
}

impl OpResult {
    fn from_status(status: bool) -> Self {
        if status {
            OpResult::Completed
        } else {
            OpResult::Declined
        }
    }
}

impl SimulatedTrader {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
        }
    }

    /// Issue `op` as this trader.
    pub async fn execute(&self, service: &WalletService, op: &TradeOp) -> OpResult {
        let result = match op {
            TradeOp::Deposit(amount) => service.deposit(self.id, *amount).await.map(|_| true),
            TradeOp::Withdraw(amount) => service
                .withdraw(self.id, *amount)
                .await
                .map(|outcome| outcome.status()),
            TradeOp::Buy { currency, amount } => service
                .buy(self.id, currency, *amount)
                .await
                .map(|outcome| outcome.status()),
            TradeOp::Sell { currency, amount } => service
                .sell(self.id, currency, *amount)
                .await
                .map(|outcome| outcome.status()),
        };

        match result {
            Ok(status) => OpResult::from_status(status),
            Err(e) => OpResult::Failed(e),
        }
    }
}

/// Trader factory for creating test owners.
pub struct TraderFactory;

impl TraderFactory {
    /// Create N simulated traders with owner ids 1..=N.
    pub fn create_traders(count: usize) -> Vec<SimulatedTrader> {
        const NAMES: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];

        (0..count)
            .map(|i| {
                let name = match NAMES.get(i) {
                    Some(name) => name.to_string(),
                    None => format!("trader-{}", i + 1),
                };
                SimulatedTrader::new(i as i64 + 1, name)
            })
            .collect()
    }
}
