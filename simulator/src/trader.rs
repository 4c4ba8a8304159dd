//! Simulated traders and the instruments they trade.

use rust_decimal::Decimal;

use yolo_common::{AccountId, Result};
use yolo_ledger::{Instrument, NewInstrument};
use yolo_trading::TradingService;

/// A simulated trader backed by a ledger account.
#[derive(Debug, Clone)]
pub struct SimulatedTrader {
    /// Position in the trader list; scenarios refer to traders by index.
    pub index: usize,
    pub id: AccountId,
    pub username: String,
}

/// Factory for traders and instruments.
///
/// Names carry a per-run tag so repeated runs against one database do not
/// collide on usernames or symbols.
pub struct TraderFactory;

impl TraderFactory {
    /// Open `count` trader accounts.
    pub async fn create_traders(
        service: &TradingService,
        count: usize,
        tag: &str,
    ) -> Result<Vec<SimulatedTrader>> {
        let names = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
        ];

        let mut traders = Vec::with_capacity(count);
        for index in 0..count {
            let base = match names.get(index) {
                Some(name) => name.to_string(),
                None => format!("trader{}", index + 1),
            };
            let account = service.open_account(&format!("{}-{}", base, tag)).await?;
            traders.push(SimulatedTrader {
                index,
                id: account.id,
                username: account.username,
            });
        }
        Ok(traders)
    }

    /// Issue `count` instruments from `issuer`. Instrument `i` is priced at
    /// `1 + i * 0.25`.
    pub async fn issue_instruments(
        service: &TradingService,
        issuer: AccountId,
        count: usize,
        tag: &str,
    ) -> Result<Vec<Instrument>> {
        let names = [
            "Moon Shot", "Diamond Hands", "Rocket Fuel", "Paper Hands", "Lambo Fund",
        ];

        let mut instruments = Vec::with_capacity(count);
        for index in 0..count {
            let name = match names.get(index) {
                Some(name) => name.to_string(),
                None => format!("Meme {}", index + 1),
            };
            let price = Decimal::ONE + Decimal::new(25, 2) * Decimal::from(index);
            let instrument = service
                .issue_instrument(NewInstrument {
                    issuer_id: issuer,
                    symbol: format!("Y{}{}", tag, index),
                    name,
                    supply: None,
                    price: Some(price),
                    description: Some("Simulated instrument".to_string()),
                })
                .await?;
            instruments.push(instrument);
        }
        Ok(instruments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use yolo_ledger::MemoryStore;
    use yolo_trading::TradingConfig;

    #[tokio::test]
    async fn test_create_traders_and_instruments() {
        let service = TradingService::new(Arc::new(MemoryStore::new()), TradingConfig::default());

        let traders = TraderFactory::create_traders(&service, 12, "AB12").await.unwrap();
        assert_eq!(traders.len(), 12);
        assert_eq!(traders[0].username, "alice-AB12");
        assert_eq!(traders[11].username, "trader12-AB12");

        let instruments = TraderFactory::issue_instruments(&service, traders[0].id, 3, "AB12")
            .await
            .unwrap();
        assert_eq!(instruments[0].price, dec!(1));
        assert_eq!(instruments[2].price, dec!(1.50));
        assert_eq!(instruments[1].symbol.as_str(), "YAB121");
    }
}
