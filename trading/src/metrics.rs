//! Metrics collection for settlement and gift monitoring.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

use yolo_common::{ErrorKind, InstrumentId, Side, TradingError};

/// Trading metrics.
pub struct Metrics {
    /// Completed buys.
    pub buys_total: AtomicU64,
    /// Completed sells.
    pub sells_total: AtomicU64,
    /// Settlements that returned an error.
    pub settlements_failed: AtomicU64,
    /// Completed gifts.
    pub gifts_total: AtomicU64,
    /// Gifts that returned an error.
    pub gifts_failed: AtomicU64,
    /// Retryable conflicts surfaced to callers.
    pub conflicts_total: AtomicU64,
    failures_by_kind: DashMap<ErrorKind, u64>,
    volume_by_instrument: DashMap<InstrumentId, Decimal>,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            buys_total: AtomicU64::new(0),
            sells_total: AtomicU64::new(0),
            settlements_failed: AtomicU64::new(0),
            gifts_total: AtomicU64::new(0),
            gifts_failed: AtomicU64::new(0),
            conflicts_total: AtomicU64::new(0),
            failures_by_kind: DashMap::new(),
            volume_by_instrument: DashMap::new(),
        }
    }

    /// Record a settled trade and its traded quantity.
    pub fn settlement_completed(&self, side: Side, instrument_id: InstrumentId, amount: Decimal) {
        match side {
            Side::Buy => self.buys_total.fetch_add(1, Ordering::Relaxed),
            Side::Sell => self.sells_total.fetch_add(1, Ordering::Relaxed),
        };
        let mut volume = self
            .volume_by_instrument
            .entry(instrument_id)
            .or_insert(Decimal::ZERO);
        *volume = volume.saturating_add(amount);
    }

    /// Record a failed settlement.
    pub fn settlement_failed(&self, err: &TradingError) {
        self.settlements_failed.fetch_add(1, Ordering::Relaxed);
        self.record_failure(err);
    }

    /// Record a completed gift.
    pub fn gift_completed(&self) {
        self.gifts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed gift.
    pub fn gift_failed(&self, err: &TradingError) {
        self.gifts_failed.fetch_add(1, Ordering::Relaxed);
        self.record_failure(err);
    }

    fn record_failure(&self, err: &TradingError) {
        if err.is_retryable() {
            self.conflicts_total.fetch_add(1, Ordering::Relaxed);
        }
        *self.failures_by_kind.entry(err.kind()).or_insert(0) += 1;
    }

    /// Failures recorded for one error kind.
    pub fn failures(&self, kind: ErrorKind) -> u64 {
        self.failures_by_kind.get(&kind).map(|v| *v).unwrap_or(0)
    }

    /// Quantity traded in one instrument, buys and sells combined.
    pub fn volume(&self, instrument_id: InstrumentId) -> Decimal {
        self.volume_by_instrument
            .get(&instrument_id)
            .map(|v| *v)
            .unwrap_or(Decimal::ZERO)
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            buys_total: self.buys_total.load(Ordering::Relaxed),
            sells_total: self.sells_total.load(Ordering::Relaxed),
            settlements_failed: self.settlements_failed.load(Ordering::Relaxed),
            gifts_total: self.gifts_total.load(Ordering::Relaxed),
            gifts_failed: self.gifts_failed.load(Ordering::Relaxed),
            conflicts_total: self.conflicts_total.load(Ordering::Relaxed),
            failures_by_kind: self
                .failures_by_kind
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            volume_by_instrument: self
                .volume_by_instrument
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP yolo_settlements_total Settled trades by side
# TYPE yolo_settlements_total counter
yolo_settlements_total{{side="buy"}} {}
yolo_settlements_total{{side="sell"}} {}

# HELP yolo_settlements_failed Settlements that returned an error
# TYPE yolo_settlements_failed counter
yolo_settlements_failed {}

# HELP yolo_gifts_total Completed gifts
# TYPE yolo_gifts_total counter
yolo_gifts_total {}

# HELP yolo_gifts_failed Gifts that returned an error
# TYPE yolo_gifts_failed counter
yolo_gifts_failed {}

# HELP yolo_conflicts_total Retryable conflicts
# TYPE yolo_conflicts_total counter
yolo_conflicts_total {}

# HELP yolo_failures_total Failures by error kind
# TYPE yolo_failures_total counter
"#,
            snapshot.buys_total,
            snapshot.sells_total,
            snapshot.settlements_failed,
            snapshot.gifts_total,
            snapshot.gifts_failed,
            snapshot.conflicts_total,
        );

        for (kind, count) in &snapshot.failures_by_kind {
            out.push_str(&format!("yolo_failures_total{{kind=\"{}\"}} {}\n", kind, count));
        }

        out.push_str(
            "\n# HELP yolo_traded_volume Quantity traded per instrument\n\
             # TYPE yolo_traded_volume counter\n",
        );
        for (instrument, volume) in &snapshot.volume_by_instrument {
            out.push_str(&format!(
                "yolo_traded_volume{{instrument=\"{}\"}} {}\n",
                instrument, volume
            ));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub buys_total: u64,
    pub sells_total: u64,
    pub settlements_failed: u64,
    pub gifts_total: u64,
    pub gifts_failed: u64,
    pub conflicts_total: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub volume_by_instrument: BTreeMap<String, Decimal>,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
