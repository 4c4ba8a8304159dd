//! YOLO Ledger
//!
//! Account balances, instrument holdings and the instrument registry, all
//! persisted through a transactional [`LedgerStore`]. Balance and holding
//! adjustments only happen inside a [`LedgerTransaction`], so callers can
//! compose several of them into one atomic unit.

pub mod account;
pub mod holding;
pub mod instrument;
pub mod registry;
pub mod store;
pub mod memory;
pub mod postgres;

pub use account::{Account, AccountLedger};
pub use holding::{Holding, HoldingsLedger};
pub use instrument::{Instrument, InstrumentRef};
pub use registry::{InstrumentRegistry, InstrumentSummary, InstrumentUpdate, NewInstrument};
pub use store::{LedgerStore, LedgerTransaction};
pub use memory::{FaultPoint, MemoryStore};
pub use postgres::PgStore;
