use std::fmt;

use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
    InvalidData(String),
    /// Affect state changed on disk between read and write.
    Conflict { identity: String, scope: String },
    Timeout(&'static str),
    QueueClosed,
}

/// How the retry layer should treat an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Conflict,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Sqlite(e) => match e.sqlite_error_code() {
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            StoreError::Io(e) => match e.kind() {
                std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            StoreError::Timeout(_) => ErrorClass::Transient,
            StoreError::Conflict { .. } => ErrorClass::Conflict,
            StoreError::Serde(_) | StoreError::InvalidData(_) | StoreError::QueueClosed => {
                ErrorClass::Permanent
            }
        }
    }

    /// Retry predicate shared by the turn writer and the affect store.
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::Conflict { identity, scope } => {
                write!(f, "affect state for {identity}/{scope} changed concurrently")
            }
            StoreError::Timeout(op) => write!(f, "{op} timed out"),
            StoreError::QueueClosed => write!(f, "write queue is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
