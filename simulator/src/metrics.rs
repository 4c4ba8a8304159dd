//! Simulation metrics and the ledger tally used for conservation checks.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;
use serde::Serialize;

use yolo_common::{InstrumentId, Side, TradingError};

/// Kind of simulated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Buy,
    Sell,
    Gift,
}

/// Simulation metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Total operations attempted (retries not counted).
    pub total_operations: u64,
    /// Successful operations.
    pub successful_operations: u64,
    /// Failed operations.
    pub failed_operations: u64,
    /// Attempts repeated after a retryable conflict.
    pub retries: u64,
    pub buys: u64,
    pub sells: u64,
    pub gifts: u64,
    /// Failures by error kind.
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Latency samples (ms).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            retries: 0,
            buys: 0,
            sells: 0,
            gifts: 0,
            failures_by_kind: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self, kind: OperationKind, latency_ms: u64) {
        self.total_operations += 1;
        self.successful_operations += 1;
        match kind {
            OperationKind::Buy => self.buys += 1,
            OperationKind::Sell => self.sells += 1,
            OperationKind::Gift => self.gifts += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, err: &TradingError) {
        self.total_operations += 1;
        self.failed_operations += 1;
        *self
            .failures_by_kind
            .entry(err.kind().to_string())
            .or_insert(0) += 1;
    }

    /// Record a retry after a conflict.
    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Get throughput (operations per second).
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }

        self.total_operations as f64 / duration_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals of settled trades, for the conservation check.
#[derive(Debug, Clone, Default)]
pub struct LedgerTally {
    bought: HashMap<InstrumentId, Decimal>,
    sold: HashMap<InstrumentId, Decimal>,
    spent: Decimal,
    received: Decimal,
}

impl LedgerTally {
    /// Record a settled trade.
    pub fn record_trade(
        &mut self,
        side: Side,
        instrument_id: InstrumentId,
        amount: Decimal,
        total_value: Decimal,
    ) {
        match side {
            Side::Buy => {
                *self.bought.entry(instrument_id).or_insert(Decimal::ZERO) += amount;
                self.spent += total_value;
            }
            Side::Sell => {
                *self.sold.entry(instrument_id).or_insert(Decimal::ZERO) += amount;
                self.received += total_value;
            }
        }
    }

    /// Quantity that should be held across all traders.
    pub fn expected_holdings(&self, instrument_id: InstrumentId) -> Decimal {
        let bought = self.bought.get(&instrument_id).copied().unwrap_or(Decimal::ZERO);
        let sold = self.sold.get(&instrument_id).copied().unwrap_or(Decimal::ZERO);
        bought - sold
    }

    /// Balance that should remain across all traders.
    pub fn expected_balances(&self, traders: usize, starting_balance: Decimal) -> Decimal {
        Decimal::from(traders) * starting_balance - self.spent + self.received
    }
}
