//! Simulation scenarios.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use yolo_common::ErrorKind;
use yolo_ledger::FaultPoint;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Traders the steps refer to.
    pub min_traders: usize,
    /// Instruments the steps refer to.
    pub min_instruments: usize,
    /// Needs the in-memory store.
    pub requires_fault_injection: bool,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Traders and instruments are referred to by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Buy at the posted price.
    Buy {
        trader: usize,
        instrument: usize,
        amount: Decimal,
    },
    /// Sell back at the posted price.
    Sell {
        trader: usize,
        instrument: usize,
        amount: Decimal,
    },
    /// Gift holdings to another trader.
    Gift {
        from: usize,
        to: usize,
        instrument: usize,
        quantity: Decimal,
        message: Option<String>,
    },
    /// Run random buys, sells and gifts on one instrument concurrently.
    Burst {
        instrument: usize,
        operations: usize,
        max_amount: u32,
    },
    /// Inject a store fault.
    InjectFault { fault_type: FaultType },
    /// Clear any armed fault.
    ClearFault,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Store faults that can be injected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FaultType {
    BalanceWrite,
    /// Fail the holding write after `skip` successful ones.
    HoldingWrite { skip: usize },
    TradeAppend,
    GiftAppend,
    Commit,
}

impl FaultType {
    /// Store fault point and number of matching writes to let through.
    pub fn point(&self) -> (FaultPoint, usize) {
        match *self {
            FaultType::BalanceWrite => (FaultPoint::BalanceWrite, 0),
            FaultType::HoldingWrite { skip } => (FaultPoint::HoldingWrite, skip),
            FaultType::TradeAppend => (FaultPoint::TradeAppend, 0),
            FaultType::GiftAppend => (FaultPoint::GiftAppend, 0),
            FaultType::Commit => (FaultPoint::Commit, 0),
        }
    }
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// The previous operation step succeeded.
    Succeeded,
    /// The previous operation step failed with this kind.
    FailedWith { kind: ErrorKind },
    /// Trader balance equals.
    BalanceEquals { trader: usize, amount: Decimal },
    /// Trader holding equals.
    HoldingEquals {
        trader: usize,
        instrument: usize,
        quantity: Decimal,
    },
}

impl Scenario {
    /// Load a scenario by name. Instrument 0 is issued at a price of 1.
    pub fn load(name: &str, starting_balance: Decimal) -> anyhow::Result<Self> {
        match name {
            "basic-trading" => Ok(Self::basic_trading(starting_balance)),
            "gift-ring" => Ok(Self::gift_ring()),
            "failure-injection" => Ok(Self::failure_injection(starting_balance)),
            "contention" => Ok(Self::contention()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Names accepted by [`Scenario::load`].
    pub fn names() -> &'static [&'static str] {
        &["basic-trading", "gift-ring", "failure-injection", "contention"]
    }

    /// Buy, insufficient funds, and sell without holding.
    fn basic_trading(starting_balance: Decimal) -> Self {
        use AssertCondition::*;
        use ScenarioStep::*;

        let leftover = Decimal::from(50);
        Self {
            name: "basic-trading".to_string(),
            description: "Buys and sells against the posted price".to_string(),
            min_traders: 2,
            min_instruments: 1,
            requires_fault_injection: false,
            steps: vec![
                Sell { trader: 1, instrument: 0, amount: Decimal::from(10) },
                Assert { condition: FailedWith { kind: ErrorKind::InsufficientHoldings } },
                Assert { condition: BalanceEquals { trader: 1, amount: starting_balance } },
                Buy { trader: 0, instrument: 0, amount: Decimal::from(100) },
                Assert { condition: Succeeded },
                Assert {
                    condition: BalanceEquals {
                        trader: 0,
                        amount: starting_balance - Decimal::from(100),
                    },
                },
                Assert {
                    condition: HoldingEquals {
                        trader: 0,
                        instrument: 0,
                        quantity: Decimal::from(100),
                    },
                },
                Buy { trader: 1, instrument: 0, amount: starting_balance - leftover },
                Assert { condition: Succeeded },
                Assert { condition: BalanceEquals { trader: 1, amount: leftover } },
                Buy { trader: 1, instrument: 0, amount: Decimal::from(100) },
                Assert { condition: FailedWith { kind: ErrorKind::InsufficientFunds } },
                Assert { condition: BalanceEquals { trader: 1, amount: leftover } },
                Sell { trader: 0, instrument: 0, amount: Decimal::from(40) },
                Assert { condition: Succeeded },
                Assert {
                    condition: BalanceEquals {
                        trader: 0,
                        amount: starting_balance - Decimal::from(60),
                    },
                },
                Assert {
                    condition: HoldingEquals {
                        trader: 0,
                        instrument: 0,
                        quantity: Decimal::from(60),
                    },
                },
            ],
        }
    }

    /// Gifts around a ring of three traders, plus a self-gift.
    fn gift_ring() -> Self {
        use AssertCondition::*;
        use ScenarioStep::*;

        let holding = |trader: usize, quantity: i64| Assert {
            condition: HoldingEquals {
                trader,
                instrument: 0,
                quantity: Decimal::from(quantity),
            },
        };

        Self {
            name: "gift-ring".to_string(),
            description: "Holdings passed between traders without touching balances".to_string(),
            min_traders: 3,
            min_instruments: 1,
            requires_fault_injection: false,
            steps: vec![
                Buy { trader: 0, instrument: 0, amount: Decimal::from(100) },
                Assert { condition: Succeeded },
                Gift {
                    from: 0,
                    to: 1,
                    instrument: 0,
                    quantity: Decimal::from(30),
                    message: Some("for you".to_string()),
                },
                Assert { condition: Succeeded },
                holding(0, 70),
                holding(1, 30),
                Gift { from: 0, to: 0, instrument: 0, quantity: Decimal::from(10), message: None },
                Assert { condition: FailedWith { kind: ErrorKind::InvalidArgument } },
                holding(0, 70),
                Gift { from: 1, to: 2, instrument: 0, quantity: Decimal::from(10), message: None },
                Gift { from: 2, to: 0, instrument: 0, quantity: Decimal::from(5), message: None },
                Assert { condition: Succeeded },
                holding(0, 75),
                holding(1, 20),
                holding(2, 5),
                Gift { from: 2, to: 1, instrument: 0, quantity: Decimal::from(999), message: None },
                Assert { condition: FailedWith { kind: ErrorKind::InsufficientHoldings } },
                holding(2, 5),
            ],
        }
    }

    /// Injected store failures leave no partial state behind.
    fn failure_injection(starting_balance: Decimal) -> Self {
        use AssertCondition::*;
        use ScenarioStep::*;

        let unchanged = || {
            vec![
                Assert {
                    condition: BalanceEquals {
                        trader: 0,
                        amount: starting_balance - Decimal::from(100),
                    },
                },
                Assert {
                    condition: HoldingEquals {
                        trader: 0,
                        instrument: 0,
                        quantity: Decimal::from(100),
                    },
                },
                Assert {
                    condition: HoldingEquals {
                        trader: 1,
                        instrument: 0,
                        quantity: Decimal::ZERO,
                    },
                },
            ]
        };

        let mut steps = vec![
            Buy { trader: 0, instrument: 0, amount: Decimal::from(100) },
            Assert { condition: Succeeded },
            InjectFault { fault_type: FaultType::TradeAppend },
            Buy { trader: 0, instrument: 0, amount: Decimal::from(50) },
            Assert { condition: FailedWith { kind: ErrorKind::Internal } },
        ];
        steps.extend(unchanged());
        steps.extend([
            InjectFault { fault_type: FaultType::HoldingWrite { skip: 1 } },
            Gift { from: 0, to: 1, instrument: 0, quantity: Decimal::from(30), message: None },
            Assert { condition: FailedWith { kind: ErrorKind::Internal } },
        ]);
        steps.extend(unchanged());
        steps.extend([
            InjectFault { fault_type: FaultType::Commit },
            Sell { trader: 0, instrument: 0, amount: Decimal::from(10) },
            Assert { condition: FailedWith { kind: ErrorKind::Internal } },
        ]);
        steps.extend(unchanged());
        steps.extend([
            InjectFault { fault_type: FaultType::BalanceWrite },
            Buy { trader: 0, instrument: 0, amount: Decimal::from(1) },
            Assert { condition: FailedWith { kind: ErrorKind::Internal } },
            ClearFault,
        ]);
        steps.extend(unchanged());

        Self {
            name: "failure-injection".to_string(),
            description: "Store failures at each write step roll back every write".to_string(),
            min_traders: 2,
            min_instruments: 1,
            requires_fault_injection: true,
            steps,
        }
    }

    /// Many concurrent operations on one instrument.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Concurrent buys, sells and gifts on a single instrument".to_string(),
            min_traders: 2,
            min_instruments: 1,
            requires_fault_injection: false,
            steps: vec![
                ScenarioStep::Burst {
                    instrument: 0,
                    operations: 200,
                    max_amount: 50,
                },
                ScenarioStep::Burst {
                    instrument: 0,
                    operations: 500,
                    max_amount: 10,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_load() {
        for name in Scenario::names() {
            let scenario = Scenario::load(name, Decimal::from(8000)).unwrap();
            assert_eq!(&scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("nope", Decimal::from(8000)).is_err());
    }

    #[test]
    fn test_steps_stay_within_declared_traders() {
        for name in Scenario::names() {
            let scenario = Scenario::load(name, Decimal::from(8000)).unwrap();
            for step in &scenario.steps {
                let traders: Vec<usize> = match step {
                    ScenarioStep::Buy { trader, .. } | ScenarioStep::Sell { trader, .. } => {
                        vec![*trader]
                    }
                    ScenarioStep::Gift { from, to, .. } => vec![*from, *to],
                    _ => Vec::new(),
                };
                assert!(traders.iter().all(|t| *t < scenario.min_traders), "{}", name);
            }
        }
    }

    #[test]
    fn test_scenario_serializes() {
        let scenario = Scenario::load("gift-ring", Decimal::from(8000)).unwrap();
        let json = serde_json::to_string(&scenario).unwrap();
        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps.len(), scenario.steps.len());
    }
}
