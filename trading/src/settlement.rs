//! Trade settlement against the posted instrument price.
//!
//! A buy debits `amount * price` from the account and credits `amount` units
//! to its holding; a sell does the reverse. Balance, holding and the trade
//! record are written in one store transaction: either all three change or
//! none do.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use yolo_common::{
    ensure_positive, AccountId, InstrumentId, Result, Side, Trade, TradingError,
};
use yolo_ledger::{AccountLedger, HoldingsLedger, LedgerStore, LedgerTransaction};

use crate::metrics::SharedMetrics;

/// Settles buys and sells at the stored instrument price.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    metrics: SharedMetrics,
}

impl SettlementEngine {
    /// Create a new settlement engine.
    pub fn new(store: Arc<dyn LedgerStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Settle a buy or sell of `amount` units.
    #[instrument(skip(self), fields(instrument = %instrument_id, account = %account_id))]
    pub async fn settle(
        &self,
        instrument_id: InstrumentId,
        account_id: AccountId,
        side: Side,
        amount: Decimal,
    ) -> Result<Trade> {
        match self.execute(instrument_id, account_id, side, amount).await {
            Ok(trade) => {
                self.metrics
                    .settlement_completed(trade.side, trade.instrument_id, trade.amount);
                info!(
                    transaction_id = %trade.transaction_id,
                    side = %trade.side,
                    amount = %trade.amount,
                    price = %trade.price,
                    total = %trade.total_value,
                    "Trade settled"
                );
                Ok(trade)
            }
            Err(e) => {
                self.metrics.settlement_failed(&e);
                warn!(side = %side, amount = %amount, error = %e, "Settlement rejected");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        instrument_id: InstrumentId,
        account_id: AccountId,
        side: Side,
        amount: Decimal,
    ) -> Result<Trade> {
        let amount = ensure_positive(amount, "amount")?;

        let mut tx = self.store.begin().await?;
        match Self::apply(tx.as_mut(), instrument_id, account_id, side, amount).await {
            Ok(trade) => {
                tx.commit().await?;
                Ok(trade)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Validate and stage the settlement inside `tx`.
    async fn apply(
        tx: &mut dyn LedgerTransaction,
        instrument_id: InstrumentId,
        account_id: AccountId,
        side: Side,
        amount: Decimal,
    ) -> Result<Trade> {
        let instrument = tx
            .instrument(instrument_id)
            .await?
            .ok_or_else(|| TradingError::InstrumentNotFound(instrument_id.to_string()))?;

        // Account row first, then the holding row.
        let account = tx
            .lock_account(account_id)
            .await?
            .ok_or(TradingError::AccountNotFound(account_id))?;
        let holding = tx.lock_holding(account_id, instrument_id).await?;

        let trade = match side {
            Side::Buy => Trade::buy(instrument_id, account_id, amount, instrument.price)?,
            Side::Sell => Trade::sell(instrument_id, account_id, amount, instrument.price)?,
        };

        match side {
            Side::Buy => {
                AccountLedger::apply(tx, &account, trade.balance_delta()).await?;
                HoldingsLedger::apply(tx, holding, trade.quantity_delta()).await?;
            }
            Side::Sell => {
                HoldingsLedger::apply(tx, holding, trade.quantity_delta()).await?;
                AccountLedger::apply(tx, &account, trade.balance_delta()).await?;
            }
        }

        tx.append_trade(&trade).await?;
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use rust_decimal_macros::dec;
    use yolo_common::ErrorKind;
    use yolo_ledger::{FaultPoint, Instrument, InstrumentRegistry, MemoryStore, NewInstrument};

    struct TestMarket {
        store: Arc<MemoryStore>,
        engine: SettlementEngine,
        accounts: AccountLedger,
        holdings: HoldingsLedger,
        metrics: SharedMetrics,
        instrument: Instrument,
    }

    async fn create_test_market(starting_balance: Decimal, price: Decimal) -> TestMarket {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let accounts = AccountLedger::new(store.clone(), starting_balance);
        let registry = InstrumentRegistry::new(store.clone(), dec!(1), dec!(1000000));

        let issuer = accounts.open("issuer").await.unwrap();
        let instrument = registry
            .issue(NewInstrument {
                issuer_id: issuer.id,
                symbol: "YOLO".to_string(),
                name: "Yolo Stock".to_string(),
                supply: None,
                price: Some(price),
                description: None,
            })
            .await
            .unwrap();

        TestMarket {
            engine: SettlementEngine::new(store.clone(), metrics.clone()),
            holdings: HoldingsLedger::new(store.clone()),
            store,
            accounts,
            metrics,
            instrument,
        }
    }

    #[tokio::test]
    async fn test_buy_debits_balance_and_credits_holding() {
        let market = create_test_market(dec!(8000.00), dec!(1.00)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        let trade = market
            .engine
            .settle(market.instrument.id, alice.id, Side::Buy, dec!(100))
            .await
            .unwrap();

        assert_eq!(trade.total_value, dec!(100.00));
        assert_eq!(trade.price, dec!(1.00));
        assert_eq!(trade.seller_id, None);
        assert!(trade.transaction_id.as_str().starts_with("txn-"));
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(7900.00));
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            dec!(100)
        );
        assert_eq!(market.store.trade_count().await, 1);
        assert_eq!(market.metrics.volume(market.instrument.id), dec!(100));
    }

    #[tokio::test]
    async fn test_buy_with_insufficient_funds() {
        let market = create_test_market(dec!(50), dec!(1.00)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        let err = market
            .engine
            .settle(market.instrument.id, alice.id, Side::Buy, dec!(100))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(50));
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            Decimal::ZERO
        );
        assert_eq!(market.store.trade_count().await, 0);
        assert_eq!(market.metrics.failures(ErrorKind::InsufficientFunds), 1);
    }

    #[tokio::test]
    async fn test_sell_without_holding() {
        let market = create_test_market(dec!(8000), dec!(1.00)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        let err = market
            .engine
            .settle(market.instrument.id, alice.id, Side::Sell, dec!(10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientHoldings);
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(8000));
        assert_eq!(market.store.trade_count().await, 0);
    }

    #[tokio::test]
    async fn test_sell_credits_balance() {
        let market = create_test_market(dec!(8000), dec!(2.50)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        market
            .engine
            .settle(market.instrument.id, alice.id, Side::Buy, dec!(100))
            .await
            .unwrap();
        let trade = market
            .engine
            .settle(market.instrument.id, alice.id, Side::Sell, dec!(40))
            .await
            .unwrap();

        assert_eq!(trade.seller_id, Some(alice.id));
        assert_eq!(trade.buyer_id, alice.id);
        assert_eq!(trade.total_value, dec!(100.00));
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(7850.00));
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            dec!(60)
        );
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let market = create_test_market(dec!(8000), dec!(1)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        for amount in [Decimal::ZERO, dec!(-5)] {
            let err = market
                .engine
                .settle(market.instrument.id, alice.id, Side::Buy, amount)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(8000));
    }

    #[tokio::test]
    async fn test_unknown_instrument_and_account() {
        let market = create_test_market(dec!(8000), dec!(1)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        let err = market
            .engine
            .settle(InstrumentId::new(), alice.id, Side::Buy, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::InstrumentNotFound(_)));

        let err = market
            .engine
            .settle(market.instrument.id, AccountId::new(), Side::Buy, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_after_balance_write_rolls_back() {
        for fault in [FaultPoint::HoldingWrite, FaultPoint::TradeAppend, FaultPoint::Commit] {
            let market = create_test_market(dec!(8000), dec!(1)).await;
            let alice = market.accounts.open("alice").await.unwrap();
            market.store.inject_fault(fault);

            let err = market
                .engine
                .settle(market.instrument.id, alice.id, Side::Buy, dec!(100))
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::Internal, "fault {:?}", fault);
            assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(8000));
            assert_eq!(
                market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
                Decimal::ZERO
            );
            assert_eq!(market.store.trade_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_sell_balance_failure_restores_holding() {
        let market = create_test_market(dec!(8000), dec!(1)).await;
        let alice = market.accounts.open("alice").await.unwrap();
        market
            .engine
            .settle(market.instrument.id, alice.id, Side::Buy, dec!(100))
            .await
            .unwrap();

        // A sell writes the holding before the balance.
        market.store.inject_fault(FaultPoint::BalanceWrite);
        let err = market
            .engine
            .settle(market.instrument.id, alice.id, Side::Sell, dec!(40))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(7900));
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            dec!(100)
        );
        assert_eq!(market.store.trade_count().await, 1);
    }

    #[tokio::test]
    async fn test_overflowing_amount_is_rejected() {
        let market = create_test_market(dec!(8000), dec!(2)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        for side in [Side::Buy, Side::Sell] {
            let err = market
                .engine
                .settle(market.instrument.id, alice.id, side, Decimal::MAX)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), dec!(8000));
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            Decimal::ZERO
        );
        assert_eq!(market.store.trade_count().await, 0);
        assert_eq!(market.metrics.failures(ErrorKind::InvalidArgument), 2);
    }

    #[tokio::test]
    async fn test_trade_price_does_not_move_instrument() {
        let market = create_test_market(dec!(8000), dec!(1.25)).await;
        let alice = market.accounts.open("alice").await.unwrap();

        for _ in 0..3 {
            market
                .engine
                .settle(market.instrument.id, alice.id, Side::Buy, dec!(10))
                .await
                .unwrap();
        }

        let instrument = market.store.instrument(market.instrument.id).await.unwrap().unwrap();
        assert_eq!(instrument.price, dec!(1.25));
        assert_eq!(instrument.supply, dec!(1000000));
    }

    #[tokio::test]
    async fn test_concurrent_buys_never_overdraw() {
        let market = create_test_market(dec!(1000), dec!(1)).await;
        let alice = market.accounts.open("alice").await.unwrap();
        let engine = Arc::new(market.engine);
        let (instrument, account) = (market.instrument.id, alice.id);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.settle(instrument, account, Side::Buy, dec!(100)).await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let settled = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert_eq!(settled, 10);
        assert_eq!(market.accounts.balance(alice.id).await.unwrap(), Decimal::ZERO);
        assert_eq!(
            market.holdings.get(alice.id, market.instrument.id).await.unwrap(),
            dec!(1000)
        );
    }
}
