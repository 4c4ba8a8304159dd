//! Instrument definitions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use yolo_common::{checked_mul, AccountId, InstrumentId, Result, Symbol};

/// A tradable token ("stock") with a posted price and a supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Unique instrument identifier.
    pub id: InstrumentId,
    /// Unique ticker symbol.
    pub symbol: Symbol,
    /// Display name.
    pub name: String,
    /// Account that issued the instrument.
    pub issuer_id: AccountId,
    /// Optional project description.
    pub description: Option<String>,
    /// Posted price. Always greater than zero.
    pub price: Decimal,
    /// Circulating supply.
    pub supply: Decimal,
    /// When the instrument was issued.
    pub created_at: DateTime<Utc>,
}

impl Instrument {
    /// Default posted price for a new instrument.
    pub const DEFAULT_PRICE: Decimal = Decimal::ONE;

    /// Maximum display name length.
    pub const MAX_NAME_LEN: usize = 100;

    /// Create a new instrument record.
    pub fn issue(
        issuer_id: AccountId,
        symbol: Symbol,
        name: impl Into<String>,
        price: Decimal,
        supply: Decimal,
        description: Option<String>,
    ) -> Self {
        Self {
            id: InstrumentId::new(),
            symbol,
            name: name.into(),
            issuer_id,
            description,
            price,
            supply,
            created_at: yolo_common::now(),
        }
    }

    /// Market capitalization at the posted price.
    pub fn market_cap(&self) -> Result<Decimal> {
        checked_mul(self.price, self.supply, "supply")
    }

    /// Value of a quantity at the posted price.
    pub fn value_of(&self, quantity: Decimal) -> Result<Decimal> {
        checked_mul(quantity, self.price, "quantity")
    }
}

/// How a caller names an instrument: by id or by symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentRef {
    Id(InstrumentId),
    Symbol(Symbol),
}

impl From<InstrumentId> for InstrumentRef {
    fn from(id: InstrumentId) -> Self {
        InstrumentRef::Id(id)
    }
}

impl From<Symbol> for InstrumentRef {
    fn from(symbol: Symbol) -> Self {
        InstrumentRef::Symbol(symbol)
    }
}

impl fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentRef::Id(id) => write!(f, "{}", id),
            InstrumentRef::Symbol(symbol) => write!(f, "{}", symbol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_cap() {
        let instrument = Instrument::issue(
            AccountId::new(),
            Symbol::parse("YOLO").unwrap(),
            "Yolo Stock",
            dec!(1.50),
            dec!(1000000),
            None,
        );

        assert_eq!(instrument.market_cap().unwrap(), dec!(1500000.00));
        assert_eq!(instrument.value_of(dec!(10)).unwrap(), dec!(15.00));
    }

    #[test]
    fn test_instrument_ref_display() {
        let symbol = Symbol::parse("abc").unwrap();
        assert_eq!(InstrumentRef::from(symbol).to_string(), "ABC");
    }
}
