//! YOLO Trading
//!
//! Settlement of buys and sells against the posted instrument price, gift
//! transfers between accounts, and the service boundary that exposes them
//! together with account and instrument queries.

pub mod config;
pub mod gift;
pub mod metrics;
pub mod service;
pub mod settlement;

pub use config::TradingConfig;
pub use gift::GiftEngine;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use service::{
    ErrorBody, Portfolio, Position, SettleRequest, SettleResponse, TradingService,
    TransferRequest, TransferResponse,
};
pub use settlement::SettlementEngine;
