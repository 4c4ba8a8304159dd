//! Trading service: the request/response boundary over the ledgers and engines.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use yolo_common::{
    checked_add, ensure_positive, AccountId, ErrorKind, GiftId, GiftRecord, InstrumentId, Page,
    PageRequest, Result, Side, Symbol, Timestamp, Trade, TradeStatus, TradingError,
    TransactionId,
};
use yolo_ledger::{
    Account, AccountLedger, HoldingsLedger, Instrument, InstrumentRef, InstrumentRegistry,
    InstrumentSummary, InstrumentUpdate, LedgerStore, NewInstrument,
};

use crate::config::TradingConfig;
use crate::gift::{self, GiftEngine};
use crate::metrics::{Metrics, SharedMetrics};
use crate::settlement::SettlementEngine;

/// Buy or sell request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleRequest {
    pub instrument: InstrumentRef,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub side: Side,
    pub amount: Decimal,
}

/// Result of a settled trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleResponse {
    pub transaction_id: TransactionId,
    #[serde(rename = "type")]
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub total_value: Decimal,
    pub status: TradeStatus,
    pub message: String,
}

/// Gift request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender_id: AccountId,
    pub recipient_id: AccountId,
    pub instrument: InstrumentRef,
    pub quantity: Decimal,
    pub message: Option<String>,
}

/// Result of a completed gift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub gift_id: GiftId,
    pub quantity: Decimal,
    pub created_at: Timestamp,
}

/// One position valued at the posted price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub name: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub value: Decimal,
}

/// An account's balance and positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub positions: Vec<Position>,
    /// Sum of position values.
    pub holdings_value: Decimal,
}

/// Error payload for a request boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&TradingError> for ErrorBody {
    fn from(err: &TradingError) -> Self {
        Self {
            status: err.http_status(),
            code: err.error_code().to_string(),
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Entry point for trading, gifting and account queries.
pub struct TradingService {
    config: TradingConfig,
    store: Arc<dyn LedgerStore>,
    accounts: AccountLedger,
    holdings: HoldingsLedger,
    registry: InstrumentRegistry,
    settlement: SettlementEngine,
    gifts: GiftEngine,
    metrics: SharedMetrics,
}

impl TradingService {
    /// Create a service over `store`.
    pub fn new(store: Arc<dyn LedgerStore>, config: TradingConfig) -> Self {
        let metrics = Arc::new(Metrics::new());

        Self {
            accounts: AccountLedger::new(store.clone(), config.ledger.starting_balance),
            holdings: HoldingsLedger::new(store.clone()),
            registry: InstrumentRegistry::new(
                store.clone(),
                config.ledger.default_price,
                config.ledger.default_supply,
            ),
            settlement: SettlementEngine::new(store.clone(), metrics.clone()),
            gifts: GiftEngine::new(store.clone(), metrics.clone()),
            metrics,
            store,
            config,
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Open an account with the configured starting balance.
    pub async fn open_account(&self, username: &str) -> Result<Account> {
        self.accounts.open(username).await
    }

    /// Issue an instrument.
    pub async fn issue_instrument(&self, request: NewInstrument) -> Result<Instrument> {
        self.registry.issue(request).await
    }

    /// Edit an instrument's name or description on behalf of its issuer.
    pub async fn update_instrument(
        &self,
        issuer_id: AccountId,
        reference: &InstrumentRef,
        update: InstrumentUpdate,
    ) -> Result<Instrument> {
        self.registry.update(issuer_id, reference, update).await
    }

    pub async fn account(&self, account_id: AccountId) -> Result<Account> {
        self.accounts.get(account_id).await
    }

    /// Buy or sell at the posted price.
    #[instrument(skip(self, request), fields(instrument = %request.instrument, side = %request.side))]
    pub async fn settle(&self, request: SettleRequest) -> Result<SettleResponse> {
        ensure_positive(request.amount, "amount")?;
        let instrument = self.registry.resolve(&request.instrument).await?;

        let trade = self
            .settlement
            .settle(instrument.id, request.account_id, request.side, request.amount)
            .await?;

        let verb = match trade.side {
            Side::Buy => "purchased",
            Side::Sell => "sold",
        };

        Ok(SettleResponse {
            message: format!(
                "Successfully {} {:.2} units of {}.",
                verb, trade.amount, instrument.name
            ),
            transaction_id: trade.transaction_id,
            side: trade.side,
            amount: trade.amount,
            price: trade.price,
            total_value: trade.total_value,
            status: trade.status,
        })
    }

    /// Gift holdings to another account.
    #[instrument(skip(self, request), fields(instrument = %request.instrument))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferResponse> {
        gift::ensure_distinct(request.sender_id, request.recipient_id)?;
        ensure_positive(request.quantity, "quantity")?;
        let instrument = self.registry.resolve(&request.instrument).await?;

        let gift = self
            .gifts
            .transfer(
                request.sender_id,
                request.recipient_id,
                instrument.id,
                request.quantity,
                request.message,
            )
            .await?;

        Ok(TransferResponse {
            gift_id: gift.id,
            quantity: gift.quantity,
            created_at: gift.created_at,
        })
    }

    /// Quantity of one instrument held by an account, zero if never held.
    pub async fn holding(&self, account_id: AccountId, instrument_id: InstrumentId) -> Result<Decimal> {
        self.holdings.get(account_id, instrument_id).await
    }

    /// Balance and non-zero positions of an account.
    pub async fn portfolio(&self, account_id: AccountId) -> Result<Portfolio> {
        let account = self.accounts.get(account_id).await?;

        let mut positions = Vec::new();
        for holding in self.holdings.holdings_of(account_id).await? {
            let instrument = self.registry.get(holding.instrument_id).await?;
            positions.push(Position {
                value: instrument.value_of(holding.quantity)?,
                instrument_id: instrument.id,
                symbol: instrument.symbol,
                name: instrument.name,
                quantity: holding.quantity,
                price: instrument.price,
            });
        }
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let holdings_value = positions
            .iter()
            .try_fold(Decimal::ZERO, |total, p| checked_add(total, p.value, "quantity"))?;

        Ok(Portfolio {
            account_id,
            balance: account.balance,
            holdings_value,
            positions,
        })
    }

    /// Trade history, newest first.
    pub async fn trades(&self, account_id: AccountId, page: PageRequest) -> Result<Page<Trade>> {
        self.accounts.get(account_id).await?;
        self.store.trades_for_account(account_id, page).await
    }

    /// Gifts sent, newest first.
    pub async fn gifts_sent(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        self.accounts.get(account_id).await?;
        self.store.gifts_sent(account_id, page).await
    }

    /// Gifts received, newest first.
    pub async fn gifts_received(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        self.accounts.get(account_id).await?;
        self.store.gifts_received(account_id, page).await
    }

    pub async fn instrument_summary(&self, reference: &InstrumentRef) -> Result<InstrumentSummary> {
        self.registry.summary(reference).await
    }

    pub async fn instruments(&self, page: PageRequest) -> Result<Page<Instrument>> {
        self.registry.list(page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use yolo_ledger::MemoryStore;

    async fn create_test_service() -> (TradingService, Account, Instrument) {
        let store = Arc::new(MemoryStore::new());
        let service = TradingService::new(store, TradingConfig::default());

        let issuer = service.open_account("issuer").await.unwrap();
        let instrument = service
            .issue_instrument(NewInstrument {
                issuer_id: issuer.id,
                symbol: "yolo".to_string(),
                name: "Yolo Stock".to_string(),
                supply: None,
                price: None,
                description: Some("to the moon".to_string()),
            })
            .await
            .unwrap();

        (service, issuer, instrument)
    }

    fn buy(instrument: impl Into<InstrumentRef>, account_id: AccountId, amount: Decimal) -> SettleRequest {
        SettleRequest {
            instrument: instrument.into(),
            account_id,
            side: Side::Buy,
            amount,
        }
    }

    #[tokio::test]
    async fn test_settle_by_symbol() {
        let (service, _, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();

        let response = service
            .settle(buy(Symbol::parse("YOLO").unwrap(), alice.id, dec!(100)))
            .await
            .unwrap();

        assert_eq!(response.total_value, dec!(100));
        assert_eq!(response.status, TradeStatus::Completed);
        assert_eq!(response.message, "Successfully purchased 100.00 units of Yolo Stock.");
        assert_eq!(service.account(alice.id).await.unwrap().balance, dec!(7900.00));

        let summary = service.instrument_summary(&instrument.id.into()).await.unwrap();
        assert_eq!(summary.owners, 1);
    }

    #[tokio::test]
    async fn test_sell_message() {
        let (service, _, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();
        service.settle(buy(instrument.id, alice.id, dec!(10))).await.unwrap();

        let response = service
            .settle(SettleRequest {
                instrument: instrument.id.into(),
                account_id: alice.id,
                side: Side::Sell,
                amount: dec!(2.5),
            })
            .await
            .unwrap();
        assert_eq!(response.message, "Successfully sold 2.50 units of Yolo Stock.");
    }

    #[tokio::test]
    async fn test_transfer_and_histories() {
        let (service, _, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();
        let bob = service.open_account("bob").await.unwrap();
        service.settle(buy(instrument.id, alice.id, dec!(100))).await.unwrap();

        let response = service
            .transfer(TransferRequest {
                sender_id: alice.id,
                recipient_id: bob.id,
                instrument: instrument.id.into(),
                quantity: dec!(30),
                message: None,
            })
            .await
            .unwrap();
        assert_eq!(response.quantity, dec!(30));

        let sent = service.gifts_sent(alice.id, PageRequest::default()).await.unwrap();
        let received = service.gifts_received(bob.id, PageRequest::default()).await.unwrap();
        assert_eq!(sent.total, 1);
        assert_eq!(received.items[0].id, response.gift_id);

        let trades = service.trades(alice.id, PageRequest::default()).await.unwrap();
        assert_eq!(trades.total, 1);
        assert!(service.trades(bob.id, PageRequest::default()).await.unwrap().items.is_empty());

        let portfolio = service.portfolio(bob.id).await.unwrap();
        assert_eq!(portfolio.positions.len(), 1);
        assert_eq!(portfolio.positions[0].symbol.as_str(), "YOLO");
        assert_eq!(portfolio.holdings_value, dec!(30));
        assert_eq!(portfolio.balance, dec!(8000.00));
    }

    #[tokio::test]
    async fn test_trades_newest_first() {
        let (service, _, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();

        let first = service.settle(buy(instrument.id, alice.id, dec!(1))).await.unwrap();
        let second = service.settle(buy(instrument.id, alice.id, dec!(2))).await.unwrap();

        let page = service.trades(alice.id, PageRequest::new(1, 1)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].transaction_id, second.transaction_id);

        let page = service.trades(alice.id, PageRequest::new(2, 1)).await.unwrap();
        assert_eq!(page.items[0].transaction_id, first.transaction_id);
    }

    #[tokio::test]
    async fn test_error_body_mapping() {
        let (service, _, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();

        let err = service
            .settle(buy(instrument.id, alice.id, dec!(9000)))
            .await
            .unwrap_err();
        let body = ErrorBody::from(&err);
        assert_eq!(body.status, 402);
        assert_eq!(body.kind, ErrorKind::InsufficientFunds);
        assert!(!body.retryable);

        let err = service
            .transfer(TransferRequest {
                sender_id: alice.id,
                recipient_id: alice.id,
                instrument: instrument.id.into(),
                quantity: dec!(1),
                message: None,
            })
            .await
            .unwrap_err();
        assert_eq!(ErrorBody::from(&err).status, 400);

        // Self-gift is rejected before the instrument is looked up.
        let err = service
            .transfer(TransferRequest {
                sender_id: alice.id,
                recipient_id: alice.id,
                instrument: Symbol::parse("NOPE").unwrap().into(),
                quantity: dec!(1),
                message: None,
            })
            .await
            .unwrap_err();
        assert_eq!(ErrorBody::from(&err).status, 400);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = service
            .settle(buy(Symbol::parse("NOPE").unwrap(), alice.id, dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(ErrorBody::from(&err).status, 404);

        let err = service.trades(AccountId::new(), PageRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_instrument_only_by_issuer() {
        let (service, issuer, instrument) = create_test_service().await;
        let alice = service.open_account("alice").await.unwrap();
        let reference: InstrumentRef = Symbol::parse("yolo").unwrap().into();

        let err = service
            .update_instrument(
                alice.id,
                &reference,
                InstrumentUpdate {
                    name: Some("Alice Coin".to_string()),
                    description: None,
                },
            )
            .await
            .unwrap_err();
        let body = ErrorBody::from(&err);
        assert_eq!(body.status, 403);
        assert_eq!(body.kind, ErrorKind::PermissionDenied);

        let updated = service
            .update_instrument(
                issuer.id,
                &reference,
                InstrumentUpdate {
                    name: Some("Yolo Prime".to_string()),
                    description: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, instrument.id);
        assert_eq!(updated.description.as_deref(), Some("to the moon"));

        let response = service
            .settle(buy(instrument.id, alice.id, dec!(1)))
            .await
            .unwrap();
        assert_eq!(response.message, "Successfully purchased 1.00 units of Yolo Prime.");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_round_trip_on_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL is not set");
        let store = yolo_ledger::PgStore::connect(&url, 5).await.unwrap();
        store.migrate().await.unwrap();
        let service = TradingService::new(Arc::new(store), TradingConfig::default());

        let tag = &AccountId::new().to_string()[..8];
        let alice = service.open_account(&format!("alice-{}", tag)).await.unwrap();
        let bob = service.open_account(&format!("bob-{}", tag)).await.unwrap();
        let instrument = service
            .issue_instrument(NewInstrument {
                issuer_id: alice.id,
                symbol: format!("R{}", tag),
                name: "Round Trip".to_string(),
                supply: None,
                price: Some(dec!(1.50)),
                description: None,
            })
            .await
            .unwrap();

        let err = service
            .settle(SettleRequest {
                instrument: instrument.id.into(),
                account_id: bob.id,
                side: Side::Sell,
                amount: dec!(5),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientHoldings);
        assert!(service.portfolio(bob.id).await.unwrap().positions.is_empty());

        service.settle(buy(instrument.id, alice.id, dec!(100))).await.unwrap();
        service
            .settle(SettleRequest {
                instrument: instrument.id.into(),
                account_id: alice.id,
                side: Side::Sell,
                amount: dec!(20),
            })
            .await
            .unwrap();
        service
            .transfer(TransferRequest {
                sender_id: alice.id,
                recipient_id: bob.id,
                instrument: instrument.id.into(),
                quantity: dec!(30),
                message: Some("gg".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(service.account(alice.id).await.unwrap().balance, dec!(7880));
        assert_eq!(service.holding(alice.id, instrument.id).await.unwrap(), dec!(50));
        assert_eq!(service.holding(bob.id, instrument.id).await.unwrap(), dec!(30));
        assert_eq!(service.account(bob.id).await.unwrap().balance, dec!(8000));
        assert_eq!(
            service.trades(alice.id, PageRequest::default()).await.unwrap().total,
            2
        );
        assert_eq!(
            service
                .instrument_summary(&instrument.id.into())
                .await
                .unwrap()
                .owners,
            2
        );
    }

    #[tokio::test]
    async fn test_settle_request_json() {
        let request: SettleRequest = serde_json::from_value(serde_json::json!({
            "instrument": { "Symbol": "YOLO" },
            "account_id": AccountId::new(),
            "type": "sell",
            "amount": "1.5"
        }))
        .unwrap();

        assert_eq!(request.side, Side::Sell);
        assert_eq!(request.amount, dec!(1.5));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Buy(usize, u32),
        Sell(usize, u32),
        Gift(usize, usize, u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1..400u32).prop_map(|(a, n)| Op::Buy(a, n)),
            (0..3usize, 1..200u32).prop_map(|(a, n)| Op::Sell(a, n)),
            (0..3usize, 0..3usize, 1..200u32).prop_map(|(a, b, n)| Op::Gift(a, b, n)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_balances_and_holdings_are_conserved(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            tokio_test::block_on(async {
                let mut config = TradingConfig::default();
                config.ledger.starting_balance = dec!(1000);
                config.ledger.default_price = dec!(1.5);
                let service = TradingService::new(Arc::new(MemoryStore::new()), config);

                let mut traders = Vec::new();
                for name in ["ann", "ben", "cat"] {
                    traders.push(service.open_account(name).await.unwrap().id);
                }
                let instrument = service
                    .issue_instrument(NewInstrument {
                        issuer_id: traders[0],
                        symbol: "PROP".to_string(),
                        name: "Prop Token".to_string(),
                        supply: None,
                        price: None,
                        description: None,
                    })
                    .await
                    .unwrap();

                let mut spent = Decimal::ZERO;
                let mut received = Decimal::ZERO;
                let mut bought = Decimal::ZERO;
                let mut sold = Decimal::ZERO;

                for op in ops {
                    match op {
                        Op::Buy(a, n) | Op::Sell(a, n) => {
                            let side = if matches!(op, Op::Buy(..)) { Side::Buy } else { Side::Sell };
                            let request = SettleRequest {
                                instrument: instrument.id.into(),
                                account_id: traders[a],
                                side,
                                amount: Decimal::from(n),
                            };
                            if let Ok(r) = service.settle(request).await {
                                match side {
                                    Side::Buy => { spent += r.total_value; bought += r.amount; }
                                    Side::Sell => { received += r.total_value; sold += r.amount; }
                                }
                            }
                        }
                        Op::Gift(a, b, n) => {
                            let _ = service
                                .transfer(TransferRequest {
                                    sender_id: traders[a],
                                    recipient_id: traders[b],
                                    instrument: instrument.id.into(),
                                    quantity: Decimal::from(n),
                                    message: None,
                                })
                                .await;
                        }
                    }
                }

                let mut balances = Decimal::ZERO;
                let mut holdings = Decimal::ZERO;
                for id in &traders {
                    let portfolio = service.portfolio(*id).await.unwrap();
                    assert!(portfolio.balance >= Decimal::ZERO);
                    balances += portfolio.balance;
                    for position in &portfolio.positions {
                        assert!(position.quantity > Decimal::ZERO);
                        holdings += position.quantity;
                    }
                }

                assert_eq!(balances, dec!(3000) - spent + received);
                assert_eq!(holdings, bought - sold);
            });
        }
    }
}
