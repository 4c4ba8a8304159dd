//! Simulation controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use yolo_common::{AccountId, ErrorKind, InstrumentId, Side, TradingError};
use yolo_ledger::{Instrument, MemoryStore};
use yolo_trading::{MetricsSnapshot, SettleRequest, TradingService, TransferRequest};

use crate::metrics::{LedgerTally, OperationKind, SimulationMetrics};
use crate::scenario::{AssertCondition, Scenario, ScenarioStep};
use crate::trader::{SimulatedTrader, TraderFactory};

/// Attempts per operation when the store reports a retryable conflict.
const MAX_ATTEMPTS: u32 = 5;

/// One ledger operation issued by a trader.
#[derive(Debug, Clone)]
enum Operation {
    Settle {
        side: Side,
        account_id: AccountId,
        instrument_id: InstrumentId,
        amount: Decimal,
    },
    Gift {
        sender_id: AccountId,
        recipient_id: AccountId,
        instrument_id: InstrumentId,
        quantity: Decimal,
        message: Option<String>,
    },
}

impl Operation {
    fn kind(&self) -> OperationKind {
        match self {
            Operation::Settle { side: Side::Buy, .. } => OperationKind::Buy,
            Operation::Settle { side: Side::Sell, .. } => OperationKind::Sell,
            Operation::Gift { .. } => OperationKind::Gift,
        }
    }

    /// A random buy, sell or gift of up to `max_amount` units.
    fn random(
        rng: &mut StdRng,
        traders: &[SimulatedTrader],
        instrument_id: InstrumentId,
        max_amount: u32,
    ) -> Self {
        let trader = &traders[rng.gen_range(0..traders.len())];
        let amount = Decimal::from(rng.gen_range(1..=max_amount.max(1)));

        match rng.gen_range(0..3) {
            0 => Operation::Settle {
                side: Side::Buy,
                account_id: trader.id,
                instrument_id,
                amount,
            },
            2 if traders.len() > 1 => {
                let mut recipient = &traders[rng.gen_range(0..traders.len())];
                while recipient.id == trader.id {
                    recipient = &traders[rng.gen_range(0..traders.len())];
                }
                Operation::Gift {
                    sender_id: trader.id,
                    recipient_id: recipient.id,
                    instrument_id,
                    quantity: amount,
                    message: None,
                }
            }
            _ => Operation::Settle {
                side: Side::Sell,
                account_id: trader.id,
                instrument_id,
                amount,
            },
        }
    }
}

/// Runs operations against the service, retrying conflicts and keeping the
/// metrics and tally current.
#[derive(Clone)]
struct Executor {
    service: Arc<TradingService>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    tally: Arc<RwLock<LedgerTally>>,
}

impl Executor {
    async fn execute(&self, operation: &Operation) -> Result<(), TradingError> {
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            match self.attempt(operation).await {
                Ok(()) => {
                    let latency = start.elapsed().as_millis() as u64;
                    self.metrics
                        .write()
                        .await
                        .record_success(operation.kind(), latency);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    debug!(attempt, error = %e, "Retrying after conflict");
                    self.metrics.write().await.record_retry();
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.write().await.record_failure(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, operation: &Operation) -> Result<(), TradingError> {
        match operation {
            Operation::Settle {
                side,
                account_id,
                instrument_id,
                amount,
            } => {
                let response = self
                    .service
                    .settle(SettleRequest {
                        instrument: (*instrument_id).into(),
                        account_id: *account_id,
                        side: *side,
                        amount: *amount,
                    })
                    .await?;
                self.tally.write().await.record_trade(
                    response.side,
                    *instrument_id,
                    response.amount,
                    response.total_value,
                );
            }
            Operation::Gift {
                sender_id,
                recipient_id,
                instrument_id,
                quantity,
                message,
            } => {
                self.service
                    .transfer(TransferRequest {
                        sender_id: *sender_id,
                        recipient_id: *recipient_id,
                        instrument: (*instrument_id).into(),
                        quantity: *quantity,
                        message: message.clone(),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Per-instrument conservation result.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentCheck {
    pub symbol: String,
    /// Bought minus sold.
    pub expected: Decimal,
    /// Sum of trader holdings.
    pub actual: Decimal,
}

/// Result of the end-of-run conservation check.
#[derive(Debug, Clone, Serialize)]
pub struct ConservationReport {
    pub balances_expected: Decimal,
    pub balances_actual: Decimal,
    pub instruments: Vec<InstrumentCheck>,
    pub negative_values: bool,
    pub conserved: bool,
}

/// Everything printed at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: Option<String>,
    pub elapsed_secs: f64,
    pub throughput: f64,
    pub p99_latency_ms: u64,
    pub simulation: SimulationMetrics,
    pub service: MetricsSnapshot,
    pub conservation: ConservationReport,
}

/// Controls the simulation.
pub struct SimulationController {
    /// Trading service under test.
    service: Arc<TradingService>,
    /// Present when running on the in-memory store.
    faults: Option<Arc<MemoryStore>>,
    /// Base seed for worker generators.
    seed: Option<u64>,
    /// Random number generator.
    rng: StdRng,
    /// Concurrent operations in flight.
    concurrency: usize,
    traders: Arc<Vec<SimulatedTrader>>,
    instruments: Arc<Vec<Instrument>>,
    executor: Executor,
    /// Outcome of the last operation step, for scenario assertions.
    last_outcome: Option<Result<(), ErrorKind>>,
    /// Running flag.
    running: Arc<AtomicBool>,
    started: Instant,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(
        service: Arc<TradingService>,
        faults: Option<Arc<MemoryStore>>,
        concurrency: usize,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            executor: Executor {
                service: service.clone(),
                metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
                tally: Arc::new(RwLock::new(LedgerTally::default())),
            },
            service,
            faults,
            seed,
            rng,
            concurrency: concurrency.max(1),
            traders: Arc::new(Vec::new()),
            instruments: Arc::new(Vec::new()),
            last_outcome: None,
            running: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        }
    }

    /// Open trader accounts and issue instruments.
    pub async fn initialize(&mut self, traders: usize, instruments: usize) -> anyhow::Result<()> {
        if traders == 0 || instruments == 0 {
            anyhow::bail!("At least one trader and one instrument are required");
        }

        let tag = format!("{:04X}", self.rng.gen::<u16>());
        info!(traders, instruments, tag = %tag, "Initializing simulation");

        let created = TraderFactory::create_traders(&self.service, traders, &tag).await?;
        for trader in &created {
            info!(trader = %trader.username, account = %trader.id, "Trader ready");
        }

        let issued =
            TraderFactory::issue_instruments(&self.service, created[0].id, instruments, &tag)
                .await?;
        for instrument in &issued {
            info!(symbol = %instrument.symbol, price = %instrument.price, "Instrument ready");
        }

        self.traders = Arc::new(created);
        self.instruments = Arc::new(issued);
        self.started = Instant::now();
        Ok(())
    }

    /// Flag that stops a continuous run.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!(scenario = %scenario.name, "{}", scenario.description);

        if self.traders.len() < scenario.min_traders {
            anyhow::bail!(
                "Scenario {} needs at least {} traders",
                scenario.name,
                scenario.min_traders
            );
        }
        if self.instruments.len() < scenario.min_instruments {
            anyhow::bail!(
                "Scenario {} needs at least {} instruments",
                scenario.name,
                scenario.min_instruments
            );
        }
        if scenario.requires_fault_injection && self.faults.is_none() {
            anyhow::bail!(
                "Scenario {} injects store faults and needs the in-memory store",
                scenario.name
            );
        }

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .map_err(|e| anyhow::anyhow!("Step {} of {}: {}", index + 1, scenario.name, e))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Run random operations on `concurrency` workers until `duration`
    /// elapses, or until the running flag is cleared when no duration is set.
    pub async fn run(&mut self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!(concurrency = self.concurrency, ?duration, "Running randomized load");

        self.running.store(true, Ordering::SeqCst);
        let deadline = duration.map(|d| Instant::now() + d);

        let workers: Vec<_> = (0..self.concurrency)
            .map(|worker| {
                let mut rng = match self.seed {
                    Some(s) => StdRng::seed_from_u64(s.wrapping_add(worker as u64 + 1)),
                    None => StdRng::from_entropy(),
                };
                let executor = self.executor.clone();
                let traders = self.traders.clone();
                let instruments = self.instruments.clone();
                let running = self.running.clone();

                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst)
                        && deadline.map_or(true, |d| Instant::now() < d)
                    {
                        let instrument = &instruments[rng.gen_range(0..instruments.len())];
                        let operation = Operation::random(&mut rng, &traders, instrument.id, 50);
                        if let Err(e) = executor.execute(&operation).await {
                            debug!(worker, error = %e, "Operation rejected");
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Buy {
                trader,
                instrument,
                amount,
            }
            | ScenarioStep::Sell {
                trader,
                instrument,
                amount,
            } => {
                let side = if matches!(step, ScenarioStep::Buy { .. }) {
                    Side::Buy
                } else {
                    Side::Sell
                };
                let operation = Operation::Settle {
                    side,
                    account_id: self.trader(*trader)?.id,
                    instrument_id: self.instrument(*instrument)?.id,
                    amount: *amount,
                };
                self.execute_operation(operation).await;
            }
            ScenarioStep::Gift {
                from,
                to,
                instrument,
                quantity,
                message,
            } => {
                let operation = Operation::Gift {
                    sender_id: self.trader(*from)?.id,
                    recipient_id: self.trader(*to)?.id,
                    instrument_id: self.instrument(*instrument)?.id,
                    quantity: *quantity,
                    message: message.clone(),
                };
                self.execute_operation(operation).await;
            }
            ScenarioStep::Burst {
                instrument,
                operations,
                max_amount,
            } => {
                let instrument_id = self.instrument(*instrument)?.id;
                let batch: Vec<Operation> = (0..*operations)
                    .map(|_| Operation::random(&mut self.rng, &self.traders, instrument_id, *max_amount))
                    .collect();

                info!(operations = batch.len(), concurrency = self.concurrency, "Running burst");
                let executor = self.executor.clone();
                futures::stream::iter(batch)
                    .for_each_concurrent(self.concurrency, |operation| {
                        let executor = executor.clone();
                        async move {
                            let _ = executor.execute(&operation).await;
                        }
                    })
                    .await;
                self.last_outcome = None;
            }
            ScenarioStep::InjectFault { fault_type } => {
                let (point, skip) = fault_type.point();
                info!(?point, skip, "Injecting fault");
                self.fault_store()?.inject_fault_after(point, skip);
            }
            ScenarioStep::ClearFault => {
                info!("Clearing fault");
                self.fault_store()?.clear_fault();
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
            }
        }

        Ok(())
    }

    async fn execute_operation(&mut self, operation: Operation) {
        let outcome = self.executor.execute(&operation).await;
        match &outcome {
            Ok(()) => info!(operation = ?operation.kind(), "Operation succeeded"),
            Err(e) => info!(operation = ?operation.kind(), error = %e, "Operation failed"),
        }
        self.last_outcome = Some(outcome.map_err(|e| e.kind()));
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::Succeeded => match &self.last_outcome {
                Some(Ok(())) => Ok(()),
                other => Err(anyhow::anyhow!("Expected success, got {:?}", other)),
            },
            AssertCondition::FailedWith { kind } => match &self.last_outcome {
                Some(Err(actual)) if actual == kind => Ok(()),
                other => Err(anyhow::anyhow!("Expected {} failure, got {:?}", kind, other)),
            },
            AssertCondition::BalanceEquals { trader, amount } => {
                let account = self.service.account(self.trader(*trader)?.id).await?;
                if account.balance != *amount {
                    anyhow::bail!(
                        "Balance of {} is {}, expected {}",
                        account.username,
                        account.balance,
                        amount
                    );
                }
                Ok(())
            }
            AssertCondition::HoldingEquals {
                trader,
                instrument,
                quantity,
            } => {
                let trader = self.trader(*trader)?;
                let instrument = self.instrument(*instrument)?;
                let held = self.service.holding(trader.id, instrument.id).await?;
                if held != *quantity {
                    anyhow::bail!(
                        "{} holds {} {}, expected {}",
                        trader.username,
                        held,
                        instrument.symbol,
                        quantity
                    );
                }
                Ok(())
            }
        }
    }

    /// Check that balances and holdings add up to what was settled.
    pub async fn verify_conservation(&self) -> anyhow::Result<ConservationReport> {
        let tally = self.executor.tally.read().await.clone();
        let starting_balance = self.service.config().ledger.starting_balance;
        let mut negative_values = false;

        let mut balances_actual = Decimal::ZERO;
        for trader in self.traders.iter() {
            let balance = self.service.account(trader.id).await?.balance;
            negative_values |= balance < Decimal::ZERO;
            balances_actual += balance;
        }
        let balances_expected = tally.expected_balances(self.traders.len(), starting_balance);

        let mut instruments = Vec::with_capacity(self.instruments.len());
        for instrument in self.instruments.iter() {
            let mut actual = Decimal::ZERO;
            for trader in self.traders.iter() {
                let held = self.service.holding(trader.id, instrument.id).await?;
                negative_values |= held < Decimal::ZERO;
                actual += held;
            }
            instruments.push(InstrumentCheck {
                symbol: instrument.symbol.to_string(),
                expected: tally.expected_holdings(instrument.id),
                actual,
            });
        }

        let conserved = !negative_values
            && balances_actual == balances_expected
            && instruments.iter().all(|c| c.actual == c.expected);

        if conserved {
            info!(balances = %balances_actual, "Conservation check passed");
        } else {
            warn!(
                expected = %balances_expected,
                actual = %balances_actual,
                negative_values,
                "Conservation check failed"
            );
        }

        Ok(ConservationReport {
            balances_expected,
            balances_actual,
            instruments,
            negative_values,
            conserved,
        })
    }

    /// Build the end-of-run report.
    pub async fn report(&self, scenario: Option<String>) -> anyhow::Result<SimulationReport> {
        let conservation = self.verify_conservation().await?;
        let simulation = self.executor.metrics.read().await.clone();
        let elapsed_secs = self.started.elapsed().as_secs_f64();

        Ok(SimulationReport {
            scenario,
            elapsed_secs,
            throughput: simulation.throughput(elapsed_secs),
            p99_latency_ms: simulation.p99_latency_ms(),
            simulation,
            service: self.service.metrics().snapshot(),
            conservation,
        })
    }

    fn trader(&self, index: usize) -> anyhow::Result<&SimulatedTrader> {
        self.traders
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("No trader at index {}", index))
    }

    fn instrument(&self, index: usize) -> anyhow::Result<&Instrument> {
        self.instruments
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("No instrument at index {}", index))
    }

    fn fault_store(&self) -> anyhow::Result<&MemoryStore> {
        self.faults
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Fault injection needs the in-memory store"))
    }
}
