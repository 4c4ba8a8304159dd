//! In-memory ledger store.
//!
//! A single async mutex guards the whole state and is held by a transaction
//! from `begin` until `commit`/`rollback`/drop, so transactions are fully
//! serialized. Writes are staged inside the transaction and only applied on
//! commit. Faults can be armed to fail a chosen write step, which is how the
//! atomicity of the engines is exercised in tests and in the simulator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use yolo_common::{
    AccountId, GiftRecord, InstrumentId, Page, PageRequest, Result, Symbol, Trade, TradingError,
    TransactionId,
};

use crate::account::Account;
use crate::holding::Holding;
use crate::instrument::Instrument;
use crate::store::{LedgerStore, LedgerTransaction};

type HoldingKey = (AccountId, InstrumentId);

/// A step inside a transaction where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BalanceWrite,
    HoldingWrite,
    TradeAppend,
    GiftAppend,
    Commit,
}

#[derive(Debug, Clone, Copy)]
struct ArmedFault {
    point: FaultPoint,
    /// Matching hits to let through before failing.
    skip: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    usernames: HashMap<String, AccountId>,
    instruments: HashMap<InstrumentId, Instrument>,
    symbols: HashMap<Symbol, InstrumentId>,
    /// Instrument ids in issuance order.
    issuance_order: Vec<InstrumentId>,
    holdings: HashMap<HoldingKey, Holding>,
    trades: Vec<Trade>,
    transaction_ids: HashSet<TransactionId>,
    gifts: Vec<GiftRecord>,
}

/// In-memory store with serializable transactions.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    fault: Arc<Mutex<Option<ArmedFault>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write that reaches `point`.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.inject_fault_after(point, 0);
    }

    /// Let `skip` writes reach `point`, then fail the following one.
    pub fn inject_fault_after(&self, point: FaultPoint, skip: usize) {
        *self.fault.lock() = Some(ArmedFault { point, skip });
    }

    /// Disarm any pending fault.
    pub fn clear_fault(&self) {
        *self.fault.lock() = None;
    }

    /// Number of committed trade records.
    pub async fn trade_count(&self) -> usize {
        self.state.lock().await.trades.len()
    }

    /// Number of committed gift records.
    pub async fn gift_count(&self) -> usize {
        self.state.lock().await.gifts.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            fault: self.fault.clone(),
            balances: HashMap::new(),
            holdings: HashMap::new(),
            trades: Vec::new(),
            gifts: Vec::new(),
        }))
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.usernames.contains_key(&account.username) {
            return Err(TradingError::AlreadyExists(format!(
                "username {}",
                account.username
            )));
        }
        state.usernames.insert(account.username.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .usernames
            .get(username)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn insert_instrument(&self, instrument: &Instrument) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.symbols.contains_key(&instrument.symbol) {
            return Err(TradingError::AlreadyExists(format!(
                "symbol {}",
                instrument.symbol
            )));
        }
        state.symbols.insert(instrument.symbol.clone(), instrument.id);
        state.issuance_order.push(instrument.id);
        state.instruments.insert(instrument.id, instrument.clone());
        Ok(())
    }

    async fn update_instrument(&self, instrument: &Instrument) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .instruments
            .get_mut(&instrument.id)
            .ok_or_else(|| TradingError::InstrumentNotFound(instrument.id.to_string()))?;
        stored.name = instrument.name.clone();
        stored.description = instrument.description.clone();
        Ok(())
    }

    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>> {
        Ok(self.state.lock().await.instruments.get(&id).cloned())
    }

    async fn instrument_by_symbol(&self, symbol: &Symbol) -> Result<Option<Instrument>> {
        let state = self.state.lock().await;
        Ok(state
            .symbols
            .get(symbol)
            .and_then(|id| state.instruments.get(id))
            .cloned())
    }

    async fn instruments(&self, page: PageRequest) -> Result<Page<Instrument>> {
        let state = self.state.lock().await;
        let ordered: Vec<Instrument> = state
            .issuance_order
            .iter()
            .filter_map(|id| state.instruments.get(id).cloned())
            .collect();
        Ok(page.slice(&ordered))
    }

    async fn holding(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Holding>> {
        Ok(self
            .state
            .lock()
            .await
            .holdings
            .get(&(account_id, instrument_id))
            .cloned())
    }

    async fn holdings_for_account(&self, account_id: AccountId) -> Result<Vec<Holding>> {
        let state = self.state.lock().await;
        let mut holdings: Vec<Holding> = state
            .holdings
            .values()
            .filter(|h| h.account_id == account_id && h.quantity > Decimal::ZERO)
            .cloned()
            .collect();
        holdings.sort_by_key(|h| h.instrument_id);
        Ok(holdings)
    }

    async fn owner_count(&self, instrument_id: InstrumentId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .holdings
            .values()
            .filter(|h| h.instrument_id == instrument_id && h.quantity > Decimal::ZERO)
            .count() as u64)
    }

    async fn trades_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<Trade>> {
        let state = self.state.lock().await;
        let trades: Vec<Trade> = state
            .trades
            .iter()
            .rev()
            .filter(|t| t.account_id() == account_id)
            .cloned()
            .collect();
        Ok(page.slice(&trades))
    }

    async fn gifts_sent(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        let state = self.state.lock().await;
        let gifts: Vec<GiftRecord> = state
            .gifts
            .iter()
            .rev()
            .filter(|g| g.sender_id == account_id)
            .cloned()
            .collect();
        Ok(page.slice(&gifts))
    }

    async fn gifts_received(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<GiftRecord>> {
        let state = self.state.lock().await;
        let gifts: Vec<GiftRecord> = state
            .gifts
            .iter()
            .rev()
            .filter(|g| g.recipient_id == account_id)
            .cloned()
            .collect();
        Ok(page.slice(&gifts))
    }
}

/// Transaction over a [`MemoryStore`]. Holds the store lock until finished.
pub struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    fault: Arc<Mutex<Option<ArmedFault>>>,
    balances: HashMap<AccountId, Decimal>,
    holdings: HashMap<HoldingKey, Holding>,
    trades: Vec<Trade>,
    gifts: Vec<GiftRecord>,
}

impl MemoryTransaction {
    fn state(&self) -> Result<&MemoryState> {
        self.guard
            .as_deref()
            .ok_or_else(|| TradingError::InternalError("Transaction already finished".to_string()))
    }

    fn trip(&self, point: FaultPoint) -> Result<()> {
        let mut armed = self.fault.lock();
        if let Some(fault) = armed.as_mut() {
            if fault.point == point {
                if fault.skip == 0 {
                    *armed = None;
                    warn!(?point, "Injected store fault");
                    return Err(TradingError::DatabaseError(format!(
                        "Injected fault at {:?}",
                        point
                    )));
                }
                fault.skip -= 1;
            }
        }
        Ok(())
    }

    fn read_account(&self, id: AccountId) -> Result<Option<Account>> {
        let state = self.state()?;
        Ok(state.accounts.get(&id).cloned().map(|mut account| {
            if let Some(balance) = self.balances.get(&id) {
                account.balance = *balance;
            }
            account
        }))
    }

    fn discard(&mut self) {
        self.balances.clear();
        self.holdings.clear();
        self.trades.clear();
        self.gifts.clear();
        self.guard = None;
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>> {
        self.read_account(id)
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        // The whole store is already locked by this transaction.
        self.read_account(id)
    }

    async fn instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>> {
        Ok(self.state()?.instruments.get(&id).cloned())
    }

    async fn lock_holding(
        &mut self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Holding> {
        let key = (account_id, instrument_id);
        if let Some(staged) = self.holdings.get(&key) {
            return Ok(staged.clone());
        }
        Ok(self
            .state()?
            .holdings
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Holding::empty(account_id, instrument_id)))
    }

    async fn write_balance(&mut self, account_id: AccountId, balance: Decimal) -> Result<()> {
        self.trip(FaultPoint::BalanceWrite)?;
        if !self.state()?.accounts.contains_key(&account_id) {
            return Err(TradingError::AccountNotFound(account_id));
        }
        if balance < Decimal::ZERO {
            return Err(TradingError::InternalError(format!(
                "Refusing to store negative balance {} for {}",
                balance, account_id
            )));
        }
        self.balances.insert(account_id, balance);
        Ok(())
    }

    async fn write_holding(&mut self, holding: &Holding) -> Result<()> {
        self.trip(FaultPoint::HoldingWrite)?;
        if holding.quantity < Decimal::ZERO {
            return Err(TradingError::InternalError(format!(
                "Refusing to store negative quantity {} for {}",
                holding.quantity, holding.account_id
            )));
        }
        self.holdings
            .insert((holding.account_id, holding.instrument_id), holding.clone());
        Ok(())
    }

    async fn append_trade(&mut self, trade: &Trade) -> Result<()> {
        self.trip(FaultPoint::TradeAppend)?;
        let duplicate = self.state()?.transaction_ids.contains(&trade.transaction_id)
            || self
                .trades
                .iter()
                .any(|t| t.transaction_id == trade.transaction_id);
        if duplicate {
            return Err(TradingError::DuplicateTransactionId(
                trade.transaction_id.to_string(),
            ));
        }
        self.trades.push(trade.clone());
        Ok(())
    }

    async fn append_gift(&mut self, gift: &GiftRecord) -> Result<()> {
        self.trip(FaultPoint::GiftAppend)?;
        self.gifts.push(gift.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if let Err(e) = self.trip(FaultPoint::Commit) {
            self.discard();
            return Err(e);
        }

        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| TradingError::InternalError("Transaction already finished".to_string()))?;
        let now = yolo_common::now();

        for (account_id, balance) in self.balances.drain() {
            if let Some(account) = guard.accounts.get_mut(&account_id) {
                account.balance = balance;
                account.updated_at = now;
            }
        }
        for (key, holding) in self.holdings.drain() {
            guard.holdings.insert(key, holding);
        }
        for trade in self.trades.drain(..) {
            guard.transaction_ids.insert(trade.transaction_id.clone());
            guard.trades.push(trade);
        }
        guard.gifts.append(&mut self.gifts);

        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.discard();
        Ok(())
    }
}
