//! PostgreSQL ledger store.
//!
//! Transactions run at READ COMMITTED with explicit row locks
//! (`SELECT ... FOR UPDATE`). A holding row is materialized at zero before it
//! is locked, so two first-time acquisitions of the same holding serialize on
//! the row instead of racing on the insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use yolo_common::{
    AccountId, GiftId, GiftRecord, InstrumentId, Page, PageRequest, Result, Side, Symbol, Trade,
    TradeId, TradeStatus, TradingError, TransactionId,
};

use crate::account::Account;
use crate::holding::Holding;
use crate::instrument::Instrument;
use crate::store::{LedgerStore, LedgerTransaction};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

const ACCOUNT_COLUMNS: &str = "id, username, balance, created_at, updated_at";
const INSTRUMENT_COLUMNS: &str =
    "id, symbol, name, issuer_id, description, price, supply, created_at";
const HOLDING_COLUMNS: &str = "account_id, instrument_id, quantity, updated_at";
const TRADE_COLUMNS: &str = "id, transaction_id, instrument_id, buyer_id, seller_id, side, \
                             amount, price, total_value, status, created_at";
const GIFT_COLUMNS: &str =
    "id, sender_id, recipient_id, instrument_id, quantity, message, created_at";

/// Map a driver error onto the ledger error taxonomy.
fn map_db_error(err: sqlx::Error) -> TradingError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => {
                let constraint = db.constraint().unwrap_or_default().to_string();
                if constraint.contains("transaction_id") {
                    return TradingError::DuplicateTransactionId(db.message().to_string());
                }
                return TradingError::AlreadyExists(constraint);
            }
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                warn!(error = %db.message(), "Transaction aborted by the database");
                return TradingError::SerializationFailure(db.message().to_string());
            }
            _ => {}
        }
    }
    TradingError::DatabaseError(err.to_string())
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> TradingError {
    TradingError::DatabaseError(format!("Malformed {} column: {}", column, err))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map_db_error)?),
        username: row.try_get("username").map_err(map_db_error)?,
        balance: row.try_get("balance").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
        updated_at: row.try_get("updated_at").map_err(map_db_error)?,
    })
}

fn instrument_from_row(row: &PgRow) -> Result<Instrument> {
    let symbol: String = row.try_get("symbol").map_err(map_db_error)?;
    Ok(Instrument {
        id: InstrumentId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map_db_error)?),
        symbol: Symbol::parse(&symbol).map_err(|e| corrupt("symbol", e))?,
        name: row.try_get("name").map_err(map_db_error)?,
        issuer_id: AccountId::from_uuid(row.try_get::<Uuid, _>("issuer_id").map_err(map_db_error)?),
        description: row.try_get("description").map_err(map_db_error)?,
        price: row.try_get("price").map_err(map_db_error)?,
        supply: row.try_get("supply").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn holding_from_row(row: &PgRow) -> Result<Holding> {
    Ok(Holding {
        account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id").map_err(map_db_error)?),
        instrument_id: InstrumentId::from_uuid(
            row.try_get::<Uuid, _>("instrument_id").map_err(map_db_error)?,
        ),
        quantity: row.try_get("quantity").map_err(map_db_error)?,
        updated_at: row.try_get("updated_at").map_err(map_db_error)?,
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade> {
    let side: String = row.try_get("side").map_err(map_db_error)?;
    let status: String = row.try_get("status").map_err(map_db_error)?;
    let seller: Option<Uuid> = row.try_get("seller_id").map_err(map_db_error)?;
    Ok(Trade {
        id: TradeId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map_db_error)?),
        transaction_id: TransactionId::new(
            row.try_get::<String, _>("transaction_id").map_err(map_db_error)?,
        ),
        instrument_id: InstrumentId::from_uuid(
            row.try_get::<Uuid, _>("instrument_id").map_err(map_db_error)?,
        ),
        buyer_id: AccountId::from_uuid(row.try_get::<Uuid, _>("buyer_id").map_err(map_db_error)?),
        seller_id: seller.map(AccountId::from_uuid),
        side: side.parse::<Side>().map_err(|e| corrupt("side", e))?,
        amount: row.try_get("amount").map_err(map_db_error)?,
        price: row.try_get("price").map_err(map_db_error)?,
        total_value: row.try_get("total_value").map_err(map_db_error)?,
        status: status.parse::<TradeStatus>().map_err(|e| corrupt("status", e))?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn gift_from_row(row: &PgRow) -> Result<GiftRecord> {
    Ok(GiftRecord {
        id: GiftId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map_db_error)?),
        sender_id: AccountId::from_uuid(row.try_get::<Uuid, _>("sender_id").map_err(map_db_error)?),
        recipient_id: AccountId::from_uuid(
            row.try_get::<Uuid, _>("recipient_id").map_err(map_db_error)?,
        ),
        instrument_id: InstrumentId::from_uuid(
            row.try_get::<Uuid, _>("instrument_id").map_err(map_db_error)?,
        ),
        quantity: row.try_get("quantity").map_err(map_db_error)?,
        message: row.try_get("message").map_err(map_db_error)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(map_db_error)?,
    })
}

/// Ledger store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_db_error)?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TradingError::DatabaseError(e.to_string()))?;
        info!("Ledger schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn count(&self, sql: &str, key: Uuid) -> Result<u64> {
        let total: i64 = sqlx::query_scalar(sql)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(total.max(0) as u64)
    }

    async fn gift_page(
        &self,
        column: &'static str,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        let total = self
            .count(
                &format!("SELECT COUNT(*) FROM gift_records WHERE {} = $1", column),
                *account_id.as_uuid(),
            )
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM gift_records WHERE {} = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            GIFT_COLUMNS, column
        ))
        .bind(*account_id.as_uuid())
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(Page {
            items: rows.iter().map(gift_from_row).collect::<Result<_>>()?,
            page: page.page(),
            limit: page.limit(),
            total,
        })
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, username, balance, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(*account.id.as_uuid())
        .bind(&account.username)
        .bind(account.balance)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE username = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn insert_instrument(&self, instrument: &Instrument) -> Result<()> {
        sqlx::query(
            "INSERT INTO instruments \
             (id, symbol, name, issuer_id, description, price, supply, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(*instrument.id.as_uuid())
        .bind(instrument.symbol.as_str())
        .bind(&instrument.name)
        .bind(*instrument.issuer_id.as_uuid())
        .bind(&instrument.description)
        .bind(instrument.price)
        .bind(instrument.supply)
        .bind(instrument.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_instrument(&self, instrument: &Instrument) -> Result<()> {
        let result = sqlx::query("UPDATE instruments SET name = $2, description = $3 WHERE id = $1")
            .bind(*instrument.id.as_uuid())
            .bind(&instrument.name)
            .bind(&instrument.description)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(TradingError::InstrumentNotFound(instrument.id.to_string()));
        }
        Ok(())
    }

    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instruments WHERE id = $1",
            INSTRUMENT_COLUMNS
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(instrument_from_row).transpose()
    }

    async fn instrument_by_symbol(&self, symbol: &Symbol) -> Result<Option<Instrument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instruments WHERE symbol = $1",
            INSTRUMENT_COLUMNS
        ))
        .bind(symbol.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(instrument_from_row).transpose()
    }

    async fn instruments(&self, page: PageRequest) -> Result<Page<Instrument>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instruments")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM instruments ORDER BY created_at, id LIMIT $1 OFFSET $2",
            INSTRUMENT_COLUMNS
        ))
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(Page {
            items: rows.iter().map(instrument_from_row).collect::<Result<_>>()?,
            page: page.page(),
            limit: page.limit(),
            total: total.max(0) as u64,
        })
    }

    async fn holding(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Holding>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM holdings WHERE account_id = $1 AND instrument_id = $2",
            HOLDING_COLUMNS
        ))
        .bind(*account_id.as_uuid())
        .bind(*instrument_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(holding_from_row).transpose()
    }

    async fn holdings_for_account(&self, account_id: AccountId) -> Result<Vec<Holding>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM holdings WHERE account_id = $1 AND quantity > 0 \
             ORDER BY instrument_id",
            HOLDING_COLUMNS
        ))
        .bind(*account_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(holding_from_row).collect()
    }

    async fn owner_count(&self, instrument_id: InstrumentId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM holdings WHERE instrument_id = $1 AND quantity > 0",
            *instrument_id.as_uuid(),
        )
        .await
    }

    async fn trades_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<Trade>> {
        let total = self
            .count(
                "SELECT COUNT(*) FROM trades WHERE buyer_id = $1",
                *account_id.as_uuid(),
            )
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE buyer_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            TRADE_COLUMNS
        ))
        .bind(*account_id.as_uuid())
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(Page {
            items: rows.iter().map(trade_from_row).collect::<Result<_>>()?,
            page: page.page(),
            limit: page.limit(),
            total,
        })
    }

    async fn gifts_sent(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        self.gift_page("sender_id", account_id, page).await
    }

    async fn gifts_received(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        self.gift_page("recipient_id", account_id, page).await
    }
}

/// Transaction over a [`PgStore`]. Rolled back by the driver if dropped
/// before commit.
pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(TradingError::InternalError(
                "Transaction already finished".to_string(),
            )),
        }
    }

    async fn fetch_account(&mut self, id: AccountId, lock: bool) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE id = $1{}",
            ACCOUNT_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(account_from_row).transpose()
    }
}

#[async_trait]
impl LedgerTransaction for PgTransaction {
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>> {
        self.fetch_account(id, false).await
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        self.fetch_account(id, true).await
    }

    async fn instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instruments WHERE id = $1",
            INSTRUMENT_COLUMNS
        ))
        .bind(*id.as_uuid())
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(instrument_from_row).transpose()
    }

    async fn lock_holding(
        &mut self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Holding> {
        sqlx::query(
            "INSERT INTO holdings (account_id, instrument_id, quantity, updated_at) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (account_id, instrument_id) DO NOTHING",
        )
        .bind(*account_id.as_uuid())
        .bind(*instrument_id.as_uuid())
        .bind(yolo_common::now())
        .execute(self.conn()?)
        .await
        .map_err(map_db_error)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM holdings WHERE account_id = $1 AND instrument_id = $2 FOR UPDATE",
            HOLDING_COLUMNS
        ))
        .bind(*account_id.as_uuid())
        .bind(*instrument_id.as_uuid())
        .fetch_one(self.conn()?)
        .await
        .map_err(map_db_error)?;
        holding_from_row(&row)
    }

    async fn write_balance(&mut self, account_id: AccountId, balance: Decimal) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(*account_id.as_uuid())
        .bind(balance)
        .bind(yolo_common::now())
        .execute(self.conn()?)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(TradingError::AccountNotFound(account_id));
        }
        Ok(())
    }

    async fn write_holding(&mut self, holding: &Holding) -> Result<()> {
        sqlx::query(
            "INSERT INTO holdings (account_id, instrument_id, quantity, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (account_id, instrument_id) \
             DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = EXCLUDED.updated_at",
        )
        .bind(*holding.account_id.as_uuid())
        .bind(*holding.instrument_id.as_uuid())
        .bind(holding.quantity)
        .bind(holding.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn append_trade(&mut self, trade: &Trade) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO trades ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            TRADE_COLUMNS
        ))
        .bind(*trade.id.as_uuid())
        .bind(trade.transaction_id.as_str())
        .bind(*trade.instrument_id.as_uuid())
        .bind(*trade.buyer_id.as_uuid())
        .bind(trade.seller_id.map(|id| *id.as_uuid()))
        .bind(trade.side.as_str())
        .bind(trade.amount)
        .bind(trade.price)
        .bind(trade.total_value)
        .bind(trade.status.as_str())
        .bind(trade.created_at)
        .execute(self.conn()?)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn append_gift(&mut self, gift: &GiftRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO gift_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            GIFT_COLUMNS
        ))
        .bind(*gift.id.as_uuid())
        .bind(*gift.sender_id.as_uuid())
        .bind(*gift.recipient_id.as_uuid())
        .bind(*gift.instrument_id.as_uuid())
        .bind(gift.quantity)
        .bind(&gift.message)
        .bind(gift.created_at)
        .execute(self.conn()?)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            TradingError::InternalError("Transaction already finished".to_string())
        })?;
        tx.commit().await.map_err(map_db_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(map_db_error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use crate::account::AccountLedger;
    use crate::holding::HoldingsLedger;
    use crate::registry::{InstrumentRegistry, InstrumentUpdate, NewInstrument};

    // These run against a disposable database:
    // DATABASE_URL=postgres://... cargo test -p yolo-ledger -- --ignored

    async fn create_test_store() -> Arc<PgStore> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL is not set");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .unwrap();
        let store = PgStore::from_pool(pool);
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    fn tag() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase()
    }

    async fn seed(store: &Arc<PgStore>) -> (AccountLedger, Account, Instrument) {
        let accounts = AccountLedger::new(store.clone(), dec!(8000));
        let registry = InstrumentRegistry::new(store.clone(), dec!(1), dec!(1000000));
        let tag = tag();

        let account = accounts.open(&format!("pg-{}", tag)).await.unwrap();
        let instrument = registry
            .issue(NewInstrument {
                issuer_id: account.id,
                symbol: format!("P{}", tag),
                name: "Pg Token".to_string(),
                supply: None,
                price: None,
                description: None,
            })
            .await
            .unwrap();
        (accounts, account, instrument)
    }

    async fn holding_rows(store: &PgStore, account: AccountId, instrument: InstrumentId) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM holdings WHERE account_id = $1 AND instrument_id = $2",
        )
        .bind(*account.as_uuid())
        .bind(*instrument.as_uuid())
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_failed_sell_leaves_no_holding_row() {
        let store = create_test_store().await;
        let (accounts, account, instrument) = seed(&store).await;

        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_account(account.id).await.unwrap().unwrap();
        let holding = tx.lock_holding(account.id, instrument.id).await.unwrap();
        assert_eq!(holding.quantity, Decimal::ZERO);

        let err = HoldingsLedger::apply(tx.as_mut(), holding, dec!(-10)).await.unwrap_err();
        assert!(matches!(err, TradingError::InsufficientHoldings { .. }));
        assert_eq!(locked.balance, dec!(8000));
        tx.rollback().await.unwrap();

        assert_eq!(holding_rows(&store, account.id, instrument.id).await, 0);
        assert!(store.holding(account.id, instrument.id).await.unwrap().is_none());
        assert_eq!(accounts.balance(account.id).await.unwrap(), dec!(8000));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_buy_and_gift_commit() {
        let store = create_test_store().await;
        let (accounts, alice, instrument) = seed(&store).await;
        let bob = accounts.open(&format!("pg-{}", tag())).await.unwrap();

        let trade = Trade::buy(instrument.id, alice.id, dec!(100), instrument.price).unwrap();
        let mut tx = store.begin().await.unwrap();
        let account = tx.lock_account(alice.id).await.unwrap().unwrap();
        let holding = tx.lock_holding(alice.id, instrument.id).await.unwrap();
        AccountLedger::apply(tx.as_mut(), &account, trade.balance_delta()).await.unwrap();
        HoldingsLedger::apply(tx.as_mut(), holding, trade.quantity_delta()).await.unwrap();
        tx.append_trade(&trade).await.unwrap();
        tx.commit().await.unwrap();

        let gift = GiftRecord::new(alice.id, bob.id, instrument.id, dec!(30), Some("hi".into()));
        let mut tx = store.begin().await.unwrap();
        HoldingsLedger::adjust(tx.as_mut(), alice.id, instrument.id, -gift.quantity)
            .await
            .unwrap();
        HoldingsLedger::adjust(tx.as_mut(), bob.id, instrument.id, gift.quantity)
            .await
            .unwrap();
        tx.append_gift(&gift).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(accounts.balance(alice.id).await.unwrap(), dec!(7900));
        let held = store.holding(alice.id, instrument.id).await.unwrap().unwrap();
        assert_eq!(held.quantity, dec!(70));
        assert_eq!(store.owner_count(instrument.id).await.unwrap(), 2);

        let trades = store.trades_for_account(alice.id, PageRequest::default()).await.unwrap();
        assert_eq!(trades.total, 1);
        assert_eq!(trades.items[0].transaction_id, trade.transaction_id);
        assert_eq!(trades.items[0].total_value, dec!(100));

        let received = store.gifts_received(bob.id, PageRequest::default()).await.unwrap();
        assert_eq!(received.items[0].id, gift.id);
        assert_eq!(received.items[0].message.as_deref(), Some("hi"));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_duplicate_transaction_id_is_retryable_conflict() {
        let store = create_test_store().await;
        let (_, account, instrument) = seed(&store).await;
        let trade = Trade::buy(instrument.id, account.id, dec!(1), dec!(1)).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.append_trade(&trade).await.unwrap();
        tx.commit().await.unwrap();

        let mut duplicate = Trade::buy(instrument.id, account.id, dec!(1), dec!(1)).unwrap();
        duplicate.transaction_id = trade.transaction_id.clone();

        let mut tx = store.begin().await.unwrap();
        let err = tx.append_trade(&duplicate).await.unwrap_err();
        tx.rollback().await.unwrap();

        assert!(matches!(err, TradingError::DuplicateTransactionId(_)));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), yolo_common::ErrorKind::Conflict);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_duplicate_username_is_not_retryable() {
        let store = create_test_store().await;
        let (_, account, _) = seed(&store).await;

        let twin = Account::open(account.username.clone(), dec!(1));
        let err = store.insert_account(&twin).await.unwrap_err();

        assert!(matches!(err, TradingError::AlreadyExists(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_update_instrument() {
        let store = create_test_store().await;
        let (_, account, instrument) = seed(&store).await;
        let registry = InstrumentRegistry::new(store.clone(), dec!(1), dec!(1000000));

        registry
            .update(
                account.id,
                &instrument.id.into(),
                InstrumentUpdate {
                    name: Some("Pg Renamed".to_string()),
                    description: Some("edited".to_string()),
                },
            )
            .await
            .unwrap();

        let stored = store.instrument(instrument.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Pg Renamed");
        assert_eq!(stored.description.as_deref(), Some("edited"));

        let mut missing = stored.clone();
        missing.id = InstrumentId::new();
        let err = store.update_instrument(&missing).await.unwrap_err();
        assert!(matches!(err, TradingError::InstrumentNotFound(_)));
    }
}
