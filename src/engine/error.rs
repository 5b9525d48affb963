use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InvalidInterval { start: NaiveTime, end: NaiveTime },
    PastDate(NaiveDate),
    NotFound(Ulid),
    Forbidden(Ulid),
    /// The operation does not apply to the record's current status, or the
    /// slot stopped being available.
    InvalidState { id: Ulid, reason: String },
    FacilityUnknown(Ulid),
    FacilityInactive(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: start {start} is not before end {end}")
            }
            LedgerError::PastDate(date) => write!(f, "date {date} is in the past"),
            LedgerError::NotFound(id) => write!(f, "not found: {id}"),
            LedgerError::Forbidden(id) => write!(f, "not permitted on {id}"),
            LedgerError::InvalidState { id, reason } => write!(f, "invalid state for {id}: {reason}"),
            LedgerError::FacilityUnknown(id) => write!(f, "unknown facility: {id}"),
            LedgerError::FacilityInactive(id) => write!(f, "facility is not active: {id}"),
            LedgerError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LedgerError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}
