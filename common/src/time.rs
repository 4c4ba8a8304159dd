//! Time helpers.

use chrono::{DateTime, SubsecRound, Utc};

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Current time truncated to microseconds.
///
/// PostgreSQL `timestamptz` keeps microsecond precision, so records built in
/// memory compare equal to the same records read back from the database.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}
