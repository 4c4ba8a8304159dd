//! Immutable trade and gift records.

use crate::{AccountId, GiftId, InstrumentId, Timestamp, TradeId, TransactionId};
use crate::error::{Result, TradingError};
use crate::monetary::checked_mul;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a settlement against the posted price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Account pays balance and receives quantity.
    Buy,
    /// Account returns quantity to the system and receives balance.
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = TradingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(TradingError::invalid_field(
                format!("Unknown trade side '{}', expected buy or sell", other),
                "type",
            )),
        }
    }
}

/// Trade status. Only settled trades are ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Completed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = TradingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TradeStatus::Completed),
            other => Err(TradingError::InternalError(format!(
                "Unknown trade status '{}'",
                other
            ))),
        }
    }
}

/// Record of a settled buy or sell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Record identifier.
    pub id: TradeId,
    /// Externally visible transaction token (unique).
    pub transaction_id: TransactionId,
    /// Instrument traded.
    pub instrument_id: InstrumentId,
    /// Account that initiated the trade.
    pub buyer_id: AccountId,
    /// Selling account; `None` when bought from the system.
    pub seller_id: Option<AccountId>,
    /// Buy or sell.
    pub side: Side,
    /// Quantity traded.
    pub amount: Decimal,
    /// Posted price used for settlement.
    pub price: Decimal,
    /// `amount * price`.
    pub total_value: Decimal,
    /// Status.
    pub status: TradeStatus,
    /// When the trade was settled.
    pub created_at: Timestamp,
}

impl Trade {
    /// Record a buy from the system at the posted price.
    pub fn buy(
        instrument_id: InstrumentId,
        account_id: AccountId,
        amount: Decimal,
        price: Decimal,
    ) -> Result<Self> {
        Self::settled(instrument_id, account_id, None, Side::Buy, amount, price)
    }

    /// Record a sell back to the system.
    ///
    /// The selling account fills both the buyer and seller fields.
    pub fn sell(
        instrument_id: InstrumentId,
        account_id: AccountId,
        amount: Decimal,
        price: Decimal,
    ) -> Result<Self> {
        Self::settled(
            instrument_id,
            account_id,
            Some(account_id),
            Side::Sell,
            amount,
            price,
        )
    }

    fn settled(
        instrument_id: InstrumentId,
        buyer_id: AccountId,
        seller_id: Option<AccountId>,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<Self> {
        let total_value = checked_mul(amount, price, "amount")?;
        Ok(Self {
            id: TradeId::new(),
            transaction_id: TransactionId::generate(),
            instrument_id,
            buyer_id,
            seller_id,
            side,
            amount,
            price,
            total_value,
            status: TradeStatus::Completed,
            created_at: crate::now(),
        })
    }

    /// The account whose ledgers the trade touched.
    pub fn account_id(&self) -> AccountId {
        self.buyer_id
    }

    /// Signed balance change caused by this trade.
    pub fn balance_delta(&self) -> Decimal {
        match self.side {
            Side::Buy => -self.total_value,
            Side::Sell => self.total_value,
        }
    }

    /// Signed holding change caused by this trade.
    pub fn quantity_delta(&self) -> Decimal {
        match self.side {
            Side::Buy => self.amount,
            Side::Sell => -self.amount,
        }
    }
}

/// Record of a peer-to-peer instrument gift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftRecord {
    pub id: GiftId,
    pub sender_id: AccountId,
    pub recipient_id: AccountId,
    pub instrument_id: InstrumentId,
    pub quantity: Decimal,
    pub message: Option<String>,
    pub created_at: Timestamp,
}

impl GiftRecord {
    /// Maximum length of a gift message in characters.
    pub const MAX_MESSAGE_LEN: usize = 500;

    pub fn new(
        sender_id: AccountId,
        recipient_id: AccountId,
        instrument_id: InstrumentId,
        quantity: Decimal,
        message: Option<String>,
    ) -> Self {
        Self {
            id: GiftId::new(),
            sender_id,
            recipient_id,
            instrument_id,
            quantity,
            message,
            created_at: crate::now(),
        }
    }
}
