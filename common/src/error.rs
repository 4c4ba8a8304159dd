//! Error types for the trading ledger.

use crate::{AccountId, InstrumentId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad amount/quantity, self-gift, malformed input.
    InvalidArgument,
    /// Unknown account, instrument or holding target.
    NotFound,
    /// Balance would go negative.
    InsufficientFunds,
    /// Holding quantity would go negative.
    InsufficientHoldings,
    /// Caller may not modify the target.
    PermissionDenied,
    /// Unique-id collision or isolation abort. Safe to retry.
    Conflict,
    /// Unexpected storage or programming failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InsufficientFunds => "InsufficientFunds",
            ErrorKind::InsufficientHoldings => "InsufficientHoldings",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Main error type for trading ledger operations.
#[derive(Error, Debug)]
pub enum TradingError {
    /// Invalid request content.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        field: Option<String>,
    },

    /// Unknown account.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Unknown instrument (by id or symbol).
    #[error("Instrument not found: {0}")]
    InstrumentNotFound(String),

    /// Balance too low for the requested debit.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    /// Holding too small for the requested debit.
    #[error("Insufficient holdings in {instrument_id}: required {required}, available {available}")]
    InsufficientHoldings {
        instrument_id: InstrumentId,
        required: Decimal,
        available: Decimal,
    },

    /// Only the issuer may edit an instrument.
    #[error("Account {account_id} did not issue instrument {symbol}")]
    NotIssuer {
        account_id: AccountId,
        symbol: String,
    },

    /// Username, symbol or other unique key already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Generated transaction id collided with an existing trade.
    #[error("Duplicate transaction id: {0}")]
    DuplicateTransactionId(String),

    /// The store aborted the transaction to preserve isolation.
    #[error("Transaction aborted by concurrent update: {0}")]
    SerializationFailure(String),

    /// Database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TradingError {
    /// Build an `InvalidArgument` error without a field.
    pub fn invalid(message: impl Into<String>) -> Self {
        TradingError::InvalidArgument {
            message: message.into(),
            field: None,
        }
    }

    /// Build an `InvalidArgument` error naming the offending field.
    pub fn invalid_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TradingError::InvalidArgument {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TradingError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            TradingError::AccountNotFound(_) | TradingError::InstrumentNotFound(_) => {
                ErrorKind::NotFound
            }
            TradingError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            TradingError::InsufficientHoldings { .. } => ErrorKind::InsufficientHoldings,
            TradingError::NotIssuer { .. } => ErrorKind::PermissionDenied,
            TradingError::AlreadyExists(_)
            | TradingError::DuplicateTransactionId(_)
            | TradingError::SerializationFailure(_) => ErrorKind::Conflict,
            TradingError::DatabaseError(_) | TradingError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A duplicate username or symbol is a conflict, but retrying the same
    /// request cannot succeed, so only store-level aborts qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::DuplicateTransactionId(_) | TradingError::SerializationFailure(_)
        )
    }

    /// Get error code for boundary responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            TradingError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            TradingError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TradingError::InstrumentNotFound(_) => "INSTRUMENT_NOT_FOUND",
            TradingError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TradingError::InsufficientHoldings { .. } => "INSUFFICIENT_HOLDINGS",
            TradingError::NotIssuer { .. } => "NOT_ISSUER",
            TradingError::AlreadyExists(_) => "ALREADY_EXISTS",
            TradingError::DuplicateTransactionId(_) => "DUPLICATE_TRANSACTION_ID",
            TradingError::SerializationFailure(_) => "SERIALIZATION_FAILURE",
            TradingError::DatabaseError(_) => "DATABASE_ERROR",
            TradingError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status a request layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::InsufficientFunds => 402,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InsufficientHoldings | ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

/// Result type alias for trading ledger operations.
pub type Result<T> = std::result::Result<T, TradingError>;
