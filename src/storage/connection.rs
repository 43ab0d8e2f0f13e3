//! Shared connection handling for the `SQLite` spool.

use crate::{Error, Result};
use rusqlite::{Connection, ErrorCode};
use std::sync::{Mutex, MutexGuard};

/// Acquires a mutex, recovering the inner value if a previous holder panicked.
///
/// The capture and upload loops share one connection; a panic in one of them
/// must not leave the other locked out of the spool.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Spool mutex was poisoned, recovering");
            metrics::counter!("lapse_spool_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a spool connection.
///
/// - **WAL mode**: the uploader reads while the scheduler writes
/// - **FULL synchronous**: a committed frame survives power loss
/// - **`busy_timeout`**: 5 seconds of lock contention before failing
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the synchronous level cannot be set.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, and in-memory databases answer "memory".
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|e| Error::operation("configure_spool", e))?;
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    Ok(())
}

/// Maps a `SQLite` failure to the crate error, singling out a full disk.
pub fn map_sqlite_error(operation: &str, err: &rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => Error::StorageExhausted(err.to_string()),
        _ => Error::operation(operation, err),
    }
}
