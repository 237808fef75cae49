//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Traders the steps refer to.
    pub traders: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. `trader` is an index into the trader list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    Deposit { trader: usize, amount: String },
    Withdraw { trader: usize, amount: String },
    Buy { trader: usize, currency: String, amount: String },
    Sell { trader: usize, currency: String, amount: String },
    /// Issue the same buy `count` times at once.
    ConcurrentBuys {
        trader: usize,
        currency: String,
        amount: String,
        count: usize,
    },
    /// Fetch rates immediately.
    RefreshRates,
    /// Inject a fault.
    InjectFault { fault_type: FaultType },
    /// Clear a fault.
    ClearFault { fault_type: FaultType },
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    /// Next ledger write fails, whichever write mode is active.
    StorageWrite,
    /// Rates provider refuses every fetch.
    UpstreamOutage,
}

/// Expected result of the previous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expected {
    Completed,
    Declined,
    Failed,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    LastOperation { expected: Expected },
    BalanceEquals {
        trader: usize,
        currency: String,
        amount: String,
    },
    TransactionCount {
        trader: usize,
        currency: String,
        count: usize,
    },
    /// Cache holds a snapshot.
    RatesAvailable,
    /// Every wallet replays to its stored balance.
    LedgerConsistent,
}

impl Scenario {
    pub const NAMES: [&'static str; 5] = [
        "walkthrough",
        "round-trip",
        "contention",
        "storage-failure",
        "upstream-outage",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "walkthrough" => Ok(Self::walkthrough()),
            "round-trip" => Ok(Self::round_trip()),
            "contention" => Ok(Self::contention()),
            "storage-failure" => Ok(Self::storage_failure()),
            "upstream-outage" => Ok(Self::upstream_outage()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Deposit, a declined buy, then a buy that fits.
    fn walkthrough() -> Self {
        Self {
            name: "walkthrough".to_string(),
            description: "Deposit, declined buy, funded buy".to_string(),
            traders: 1,
            steps: vec![
                deposit(0, "100"),
                balance(0, "USD", "100"),
                ScenarioStep::Assert {
                    condition: AssertCondition::TransactionCount {
                        trader: 0,
                        currency: "USD".to_string(),
                        count: 1,
                    },
                },
                buy(0, "BTC", "0.01"),
                last(Expected::Declined),
                balance(0, "USD", "100"),
                deposit(0, "300"),
                buy(0, "BTC", "0.01"),
                last(Expected::Completed),
                balance(0, "USD", "150"),
                balance(0, "BTC", "0.01"),
                ScenarioStep::Withdraw {
                    trader: 0,
                    amount: "200".to_string(),
                },
                last(Expected::Declined),
                consistent(),
            ],
        }
    }

    /// Buying and selling the same amount restores the base balance.
    fn round_trip() -> Self {
        Self {
            name: "round-trip".to_string(),
            description: "Buy then sell the same amount".to_string(),
            traders: 1,
            steps: vec![
                deposit(0, "1000"),
                buy(0, "ETH", "0.37"),
                last(Expected::Completed),
                balance(0, "USD", "260"),
                ScenarioStep::Sell {
                    trader: 0,
                    currency: "ETH".to_string(),
                    amount: "0.37".to_string(),
                },
                last(Expected::Completed),
                balance(0, "USD", "1000"),
                balance(0, "ETH", "0"),
                consistent(),
            ],
        }
    }

    /// Concurrent buys against one balance never overdraw it.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "25 concurrent buys against funds for 10".to_string(),
            traders: 1,
            steps: vec![
                deposit(0, "1000"),
                ScenarioStep::ConcurrentBuys {
                    trader: 0,
                    currency: "BTC".to_string(),
                    amount: "0.004".to_string(),
                    count: 25,
                },
                balance(0, "USD", "0"),
                balance(0, "BTC", "0.04"),
                consistent(),
            ],
        }
    }

    /// A failed write leaves balances untouched.
    fn storage_failure() -> Self {
        Self {
            name: "storage-failure".to_string(),
            description: "Trade during a storage failure, then recover".to_string(),
            traders: 1,
            steps: vec![
                deposit(0, "400"),
                ScenarioStep::InjectFault {
                    fault_type: FaultType::StorageWrite,
                },
                buy(0, "BTC", "0.01"),
                last(Expected::Failed),
                balance(0, "USD", "400"),
                balance(0, "BTC", "0"),
                ScenarioStep::ClearFault {
                    fault_type: FaultType::StorageWrite,
                },
                buy(0, "BTC", "0.01"),
                last(Expected::Completed),
                balance(0, "USD", "150"),
                consistent(),
            ],
        }
    }

    /// Trading continues on the last snapshot while upstream is down.
    fn upstream_outage() -> Self {
        Self {
            name: "upstream-outage".to_string(),
            description: "Upstream rates go away; cached rates keep serving".to_string(),
            traders: 2,
            steps: vec![
                ScenarioStep::Assert {
                    condition: AssertCondition::RatesAvailable,
                },
                ScenarioStep::InjectFault {
                    fault_type: FaultType::UpstreamOutage,
                },
                ScenarioStep::RefreshRates,
                ScenarioStep::Wait { millis: 50 },
                ScenarioStep::Assert {
                    condition: AssertCondition::RatesAvailable,
                },
                deposit(0, "400"),
                deposit(1, "50"),
                buy(0, "BTC", "0.01"),
                last(Expected::Completed),
                buy(1, "BTC", "0.01"),
                last(Expected::Declined),
                ScenarioStep::ClearFault {
                    fault_type: FaultType::UpstreamOutage,
                },
                ScenarioStep::RefreshRates,
                balance(0, "USD", "150"),
                balance(1, "USD", "50"),
                consistent(),
            ],
        }
    }
}

fn deposit(trader: usize, amount: &str) -> ScenarioStep {
    ScenarioStep::Deposit {
        trader,
        amount: amount.to_string(),
    }
}

fn buy(trader: usize, currency: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Buy {
        trader,
        currency: currency.to_string(),
        amount: amount.to_string(),
    }
}

fn last(expected: Expected) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastOperation { expected },
    }
}

fn balance(trader: usize, currency: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            trader,
            currency: currency.to_string(),
            amount: amount.to_string(),
        },
    }
}

fn consistent() -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LedgerConsistent,
    }
}
