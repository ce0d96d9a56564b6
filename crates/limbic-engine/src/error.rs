use std::fmt;

use limbic_core::TranscriptError;
use limbic_store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    Store(StoreError),
    Transcript(TranscriptError),
    /// A blocking or remote call exceeded its bound.
    Timeout(&'static str),
    Embedding(String),
    Metrics(String),
    /// A blocking task panicked or was cancelled.
    Task(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Store(e) => write!(f, "{e}"),
            EngineError::Transcript(e) => write!(f, "invalid transcript: {e}"),
            EngineError::Timeout(op) => write!(f, "{op} timed out"),
            EngineError::Embedding(msg) => write!(f, "embedding error: {msg}"),
            EngineError::Metrics(msg) => write!(f, "metrics error: {msg}"),
            EngineError::Task(msg) => write!(f, "background task failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<TranscriptError> for EngineError {
    fn from(e: TranscriptError) -> Self {
        EngineError::Transcript(e)
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout("embedding request")
        } else {
            EngineError::Embedding(e.to_string())
        }
    }
}

impl From<prometheus::Error> for EngineError {
    fn from(e: prometheus::Error) -> Self {
        EngineError::Metrics(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
