//! Accounts and the account ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use yolo_common::{checked_add, AccountId, Result, TradingError};

use crate::store::{LedgerStore, LedgerTransaction};

/// A user's fungible balance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Login name, unique across accounts.
    pub username: String,
    /// Spendable balance. Never negative between transactions.
    pub balance: Decimal,
    /// When the account was opened.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Maximum username length.
    pub const MAX_USERNAME_LEN: usize = 50;

    /// Create a new account with a starting balance.
    pub fn open(username: impl Into<String>, starting_balance: Decimal) -> Self {
        let now = yolo_common::now();
        Self {
            id: AccountId::new(),
            username: username.into(),
            balance: starting_balance,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Account ledger: opening accounts and transactional balance adjustments.
pub struct AccountLedger {
    store: Arc<dyn LedgerStore>,
    starting_balance: Decimal,
}

impl AccountLedger {
    /// Create a new account ledger.
    pub fn new(store: Arc<dyn LedgerStore>, starting_balance: Decimal) -> Self {
        Self {
            store,
            starting_balance,
        }
    }

    /// Balance granted to newly opened accounts.
    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    /// Open an account with the configured starting balance.
    #[instrument(skip(self))]
    pub async fn open(&self, username: &str) -> Result<Account> {
        let username = username.trim();
        if username.is_empty() || username.chars().count() > Account::MAX_USERNAME_LEN {
            return Err(TradingError::invalid_field(
                format!(
                    "Username must be 1-{} characters",
                    Account::MAX_USERNAME_LEN
                ),
                "username",
            ));
        }

        if self.store.account_by_username(username).await?.is_some() {
            return Err(TradingError::AlreadyExists(format!("username {}", username)));
        }

        let account = Account::open(username, self.starting_balance);
        self.store.insert_account(&account).await?;

        info!(
            account = %account.id,
            username = %account.username,
            balance = %account.balance,
            "Account opened"
        );

        Ok(account)
    }

    /// Get an account by ID.
    pub async fn get(&self, account_id: AccountId) -> Result<Account> {
        self.store
            .account(account_id)
            .await?
            .ok_or(TradingError::AccountNotFound(account_id))
    }

    /// Get an account's current balance.
    pub async fn balance(&self, account_id: AccountId) -> Result<Decimal> {
        Ok(self.get(account_id).await?.balance)
    }

    /// Apply a signed balance change inside `tx` and return the new balance.
    ///
    /// Locks the account row. Fails with `InsufficientFunds` if the result
    /// would be negative; nothing is written in that case.
    pub async fn adjust_balance(
        tx: &mut dyn LedgerTransaction,
        account_id: AccountId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let account = tx
            .lock_account(account_id)
            .await?
            .ok_or(TradingError::AccountNotFound(account_id))?;
        Self::apply(tx, &account, delta).await
    }

    /// Apply a signed balance change to an account already locked in `tx`.
    pub async fn apply(
        tx: &mut dyn LedgerTransaction,
        account: &Account,
        delta: Decimal,
    ) -> Result<Decimal> {
        let new_balance = checked_add(account.balance, delta, "amount")?;
        if new_balance < Decimal::ZERO {
            return Err(TradingError::InsufficientFunds {
                required: -delta,
                available: account.balance,
            });
        }

        tx.write_balance(account.id, new_balance).await?;

        debug!(
            account = %account.id,
            delta = %delta,
            balance = %new_balance,
            "Balance adjusted"
        );

        Ok(new_balance)
    }
}
