//! Holdings and the holdings ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use yolo_common::{checked_add, AccountId, InstrumentId, Result, TradingError};

use crate::store::{LedgerStore, LedgerTransaction};

/// Quantity of one instrument owned by one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    /// Never negative. A zero row may remain after a full sale.
    pub quantity: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    /// An empty holding, as seen before the first acquisition.
    pub fn empty(account_id: AccountId, instrument_id: InstrumentId) -> Self {
        Self {
            account_id,
            instrument_id,
            quantity: Decimal::ZERO,
            updated_at: yolo_common::now(),
        }
    }
}

/// Holdings ledger: keyed lookups and transactional quantity adjustments.
pub struct HoldingsLedger {
    store: Arc<dyn LedgerStore>,
}

impl HoldingsLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Quantity held, zero if the account never held the instrument.
    pub async fn get(&self, account_id: AccountId, instrument_id: InstrumentId) -> Result<Decimal> {
        Ok(self
            .store
            .holding(account_id, instrument_id)
            .await?
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO))
    }

    /// Non-zero positions of an account.
    pub async fn holdings_of(&self, account_id: AccountId) -> Result<Vec<Holding>> {
        self.store.holdings_for_account(account_id).await
    }

    /// Apply a signed quantity change inside `tx` and return the new quantity.
    ///
    /// Locks the holding row, creating it at zero if absent. Fails with
    /// `InsufficientHoldings` if the result would be negative; nothing is
    /// written in that case.
    pub async fn adjust(
        tx: &mut dyn LedgerTransaction,
        account_id: AccountId,
        instrument_id: InstrumentId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let holding = tx.lock_holding(account_id, instrument_id).await?;
        Self::apply(tx, holding, delta).await
    }

    /// Apply a signed change to a holding already locked in `tx`.
    pub async fn apply(
        tx: &mut dyn LedgerTransaction,
        mut holding: Holding,
        delta: Decimal,
    ) -> Result<Decimal> {
        let new_quantity = checked_add(holding.quantity, delta, "quantity")?;
        if new_quantity < Decimal::ZERO {
            return Err(TradingError::InsufficientHoldings {
                instrument_id: holding.instrument_id,
                required: -delta,
                available: holding.quantity,
            });
        }

        holding.quantity = new_quantity;
        holding.updated_at = yolo_common::now();
        tx.write_holding(&holding).await?;

        debug!(
            account = %holding.account_id,
            instrument = %holding.instrument_id,
            delta = %delta,
            quantity = %new_quantity,
            "Holding adjusted"
        );

        Ok(new_quantity)
    }
}
