//! Instrument registry: issuance and lookup.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use yolo_common::{
    checked_mul, ensure_positive, AccountId, InstrumentId, Page, PageRequest, Result, Symbol,
    TradingError,
};

use crate::instrument::{Instrument, InstrumentRef};
use crate::store::LedgerStore;

/// Parameters for issuing a new instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstrument {
    pub issuer_id: AccountId,
    pub symbol: String,
    pub name: String,
    /// Falls back to the registry's default supply.
    pub supply: Option<Decimal>,
    /// Falls back to the registry's default price.
    pub price: Option<Decimal>,
    pub description: Option<String>,
}

/// Edits to an issued instrument. Absent or blank fields keep their
/// current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// An instrument with its derived market figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSummary {
    pub instrument: Instrument,
    pub market_cap: Decimal,
    pub owners: u64,
}

/// Registry of issued instruments.
pub struct InstrumentRegistry {
    store: Arc<dyn LedgerStore>,
    default_price: Decimal,
    default_supply: Decimal,
}

impl InstrumentRegistry {
    /// Create a new registry with issuance defaults.
    pub fn new(store: Arc<dyn LedgerStore>, default_price: Decimal, default_supply: Decimal) -> Self {
        Self {
            store,
            default_price,
            default_supply,
        }
    }

    /// Issue a new instrument.
    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    pub async fn issue(&self, request: NewInstrument) -> Result<Instrument> {
        let symbol = Symbol::parse(&request.symbol)?;

        let name = validate_name(request.name.trim())?;

        let price = ensure_positive(request.price.unwrap_or(self.default_price), "price")?;
        let supply = ensure_positive(request.supply.unwrap_or(self.default_supply), "supply")?;
        checked_mul(price, supply, "supply")?;

        if self.store.account(request.issuer_id).await?.is_none() {
            return Err(TradingError::AccountNotFound(request.issuer_id));
        }

        if self.store.instrument_by_symbol(&symbol).await?.is_some() {
            return Err(TradingError::AlreadyExists(format!("symbol {}", symbol)));
        }

        let description = request
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let instrument = Instrument::issue(request.issuer_id, symbol, name, price, supply, description);
        self.store.insert_instrument(&instrument).await?;

        info!(
            instrument = %instrument.id,
            symbol = %instrument.symbol,
            price = %instrument.price,
            supply = %instrument.supply,
            "Instrument issued"
        );

        Ok(instrument)
    }

    /// Get an instrument by ID.
    pub async fn get(&self, instrument_id: InstrumentId) -> Result<Instrument> {
        self.store
            .instrument(instrument_id)
            .await?
            .ok_or_else(|| TradingError::InstrumentNotFound(instrument_id.to_string()))
    }

    /// Get an instrument by symbol.
    pub async fn by_symbol(&self, symbol: &Symbol) -> Result<Instrument> {
        self.store
            .instrument_by_symbol(symbol)
            .await?
            .ok_or_else(|| TradingError::InstrumentNotFound(symbol.to_string()))
    }

    /// Resolve a caller-supplied reference.
    pub async fn resolve(&self, reference: &InstrumentRef) -> Result<Instrument> {
        match reference {
            InstrumentRef::Id(id) => self.get(*id).await,
            InstrumentRef::Symbol(symbol) => self.by_symbol(symbol).await,
        }
    }

    /// List instruments.
    pub async fn list(&self, page: PageRequest) -> Result<Page<Instrument>> {
        self.store.instruments(page).await
    }

    /// Edit the name or description of an instrument. Only its issuer may.
    #[instrument(skip(self, update), fields(instrument = %reference, account = %issuer_id))]
    pub async fn update(
        &self,
        issuer_id: AccountId,
        reference: &InstrumentRef,
        update: InstrumentUpdate,
    ) -> Result<Instrument> {
        let mut instrument = self.resolve(reference).await?;
        if instrument.issuer_id != issuer_id {
            return Err(TradingError::NotIssuer {
                account_id: issuer_id,
                symbol: instrument.symbol.to_string(),
            });
        }

        if let Some(name) = update.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            instrument.name = validate_name(name)?.to_string();
        }
        if let Some(description) = update
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            instrument.description = Some(description.to_string());
        }

        self.store.update_instrument(&instrument).await?;

        info!(
            instrument = %instrument.id,
            symbol = %instrument.symbol,
            name = %instrument.name,
            "Instrument updated"
        );

        Ok(instrument)
    }

    /// Instrument with market cap and owner count.
    pub async fn summary(&self, reference: &InstrumentRef) -> Result<InstrumentSummary> {
        let instrument = self.resolve(reference).await?;
        let owners = self.store.owner_count(instrument.id).await?;

        Ok(InstrumentSummary {
            market_cap: instrument.market_cap()?,
            owners,
            instrument,
        })
    }
}

fn validate_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.chars().count() > Instrument::MAX_NAME_LEN {
        return Err(TradingError::invalid_field(
            format!("Name must be 1-{} characters", Instrument::MAX_NAME_LEN),
            "name",
        ));
    }
    Ok(name)
}
