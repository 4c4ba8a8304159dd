//! Transactional persistence contract behind the ledgers.
//!
//! A [`LedgerTransaction`] is the atomic unit: every read and write a
//! settlement or gift performs against account and holding rows goes through
//! one transaction, and either all of it commits or none of it does.
//! Dropping a transaction without calling [`LedgerTransaction::commit`]
//! discards every staged write.

use async_trait::async_trait;
use rust_decimal::Decimal;

use yolo_common::{
    AccountId, GiftRecord, InstrumentId, Page, PageRequest, Result, Symbol, Trade,
};

use crate::account::Account;
use crate::holding::Holding;
use crate::instrument::Instrument;

/// A store that can open transactions and answer read-only queries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction with serializable (or row-locking) isolation.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>>;

    /// Insert a newly opened account. Fails with a conflict on a taken username.
    async fn insert_account(&self, account: &Account) -> Result<()>;

    async fn account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn account_by_username(&self, username: &str) -> Result<Option<Account>>;

    /// Insert a newly issued instrument. Fails with a conflict on a taken symbol.
    async fn insert_instrument(&self, instrument: &Instrument) -> Result<()>;

    /// Overwrite the name and description of an issued instrument.
    async fn update_instrument(&self, instrument: &Instrument) -> Result<()>;

    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>>;

    async fn instrument_by_symbol(&self, symbol: &Symbol) -> Result<Option<Instrument>>;

    /// Instruments ordered by creation time.
    async fn instruments(&self, page: PageRequest) -> Result<Page<Instrument>>;

    async fn holding(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Holding>>;

    /// Holdings of an account with a quantity above zero.
    async fn holdings_for_account(&self, account_id: AccountId) -> Result<Vec<Holding>>;

    /// Number of accounts holding a positive quantity of the instrument.
    async fn owner_count(&self, instrument_id: InstrumentId) -> Result<u64>;

    /// Trades initiated by the account, newest first.
    async fn trades_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<Trade>>;

    /// Gifts sent by the account, newest first.
    async fn gifts_sent(&self, account_id: AccountId, page: PageRequest)
        -> Result<Page<GiftRecord>>;

    /// Gifts received by the account, newest first.
    async fn gifts_received(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>>;
}

/// One atomic unit of ledger work.
///
/// Lock order: account rows before holding rows, holding rows in ascending
/// account id order.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Read an account without locking it.
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>>;

    /// Read an account and hold its row until the transaction ends.
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>>;

    async fn instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>>;

    /// Read a holding and hold its row until the transaction ends.
    /// An absent holding is returned with a zero quantity.
    async fn lock_holding(
        &mut self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Holding>;

    async fn write_balance(&mut self, account_id: AccountId, balance: Decimal) -> Result<()>;

    /// Insert or update a holding row.
    async fn write_holding(&mut self, holding: &Holding) -> Result<()>;

    /// Append a trade. A duplicate transaction id is a retryable conflict.
    async fn append_trade(&mut self, trade: &Trade) -> Result<()>;

    async fn append_gift(&mut self, gift: &GiftRecord) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
