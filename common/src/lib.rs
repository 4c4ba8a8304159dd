//! YOLO Common Types
//!
//! Shared types for the trading ledger: identifiers, trade and gift records,
//! the error type, pagination and time helpers.

pub mod identifiers;
pub mod records;
pub mod error;
pub mod monetary;
pub mod pagination;
pub mod time;

pub use identifiers::*;
pub use records::*;
pub use error::*;
pub use monetary::*;
pub use pagination::*;
pub use time::*;
