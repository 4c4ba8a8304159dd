//! Peer-to-peer gift transfers of instrument holdings.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use yolo_common::{ensure_positive, AccountId, GiftRecord, InstrumentId, Result, TradingError};
use yolo_ledger::{HoldingsLedger, LedgerStore, LedgerTransaction};

use crate::metrics::SharedMetrics;

/// Moves holdings between accounts without touching balances.
pub struct GiftEngine {
    store: Arc<dyn LedgerStore>,
    metrics: SharedMetrics,
}

impl GiftEngine {
    /// Create a new gift engine.
    pub fn new(store: Arc<dyn LedgerStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Transfer `quantity` units from sender to recipient.
    ///
    /// Debit, credit and the gift record commit together or not at all.
    #[instrument(skip(self, message), fields(sender = %sender_id, recipient = %recipient_id))]
    pub async fn transfer(
        &self,
        sender_id: AccountId,
        recipient_id: AccountId,
        instrument_id: InstrumentId,
        quantity: Decimal,
        message: Option<String>,
    ) -> Result<GiftRecord> {
        match self
            .execute(sender_id, recipient_id, instrument_id, quantity, message)
            .await
        {
            Ok(gift) => {
                self.metrics.gift_completed();
                info!(
                    gift_id = %gift.id,
                    instrument = %gift.instrument_id,
                    quantity = %gift.quantity,
                    "Gift transferred"
                );
                Ok(gift)
            }
            Err(e) => {
                self.metrics.gift_failed(&e);
                warn!(quantity = %quantity, error = %e, "Gift rejected");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        sender_id: AccountId,
        recipient_id: AccountId,
        instrument_id: InstrumentId,
        quantity: Decimal,
        message: Option<String>,
    ) -> Result<GiftRecord> {
        ensure_distinct(sender_id, recipient_id)?;
        let quantity = ensure_positive(quantity, "quantity")?;
        let message = normalize_message(message)?;

        let gift = GiftRecord::new(sender_id, recipient_id, instrument_id, quantity, message);

        let mut tx = self.store.begin().await?;
        match Self::apply(tx.as_mut(), &gift).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(gift)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(tx: &mut dyn LedgerTransaction, gift: &GiftRecord) -> Result<()> {
        for account_id in [gift.sender_id, gift.recipient_id] {
            if tx.account(account_id).await?.is_none() {
                return Err(TradingError::AccountNotFound(account_id));
            }
        }
        if tx.instrument(gift.instrument_id).await?.is_none() {
            return Err(TradingError::InstrumentNotFound(gift.instrument_id.to_string()));
        }

        // Holding rows are locked in ascending account order.
        let (low, high) = if gift.sender_id < gift.recipient_id {
            (gift.sender_id, gift.recipient_id)
        } else {
            (gift.recipient_id, gift.sender_id)
        };
        let low_holding = tx.lock_holding(low, gift.instrument_id).await?;
        let high_holding = tx.lock_holding(high, gift.instrument_id).await?;
        let (sender_holding, recipient_holding) = if low == gift.sender_id {
            (low_holding, high_holding)
        } else {
            (high_holding, low_holding)
        };

        HoldingsLedger::apply(tx, sender_holding, -gift.quantity).await?;
        HoldingsLedger::apply(tx, recipient_holding, gift.quantity).await?;
        tx.append_gift(gift).await
    }
}

/// Reject a gift whose sender is also its recipient.
pub fn ensure_distinct(sender_id: AccountId, recipient_id: AccountId) -> Result<()> {
    if sender_id == recipient_id {
        return Err(TradingError::invalid_field(
            "Cannot send gift to yourself",
            "recipient_id",
        ));
    }
    Ok(())
}

/// Trim a gift message, dropping it when blank.
fn normalize_message(message: Option<String>) -> Result<Option<String>> {
    let message = message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    if let Some(m) = &message {
        if m.chars().count() > GiftRecord::MAX_MESSAGE_LEN {
            return Err(TradingError::invalid_field(
                format!(
                    "Message must be at most {} characters",
                    GiftRecord::MAX_MESSAGE_LEN
                ),
                "message",
            ));
        }
    }
    Ok(message)
}
