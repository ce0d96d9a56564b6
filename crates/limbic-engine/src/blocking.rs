use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use limbic_store::StoreError;

use crate::error::{EngineError, Result};

/// Run a synchronous store call on the blocking pool, bounded by `limit`.
/// The call keeps running if the bound fires; only the wait is abandoned.
pub(crate) async fn run_blocking<T, F>(limit: Duration, op: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(EngineError::Timeout(op)),
        Ok(Err(join)) => Err(EngineError::Task(join.to_string())),
        Ok(Ok(result)) => result.map_err(EngineError::from),
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::result::Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::InvalidData("connection lock poisoned".into()))
}
