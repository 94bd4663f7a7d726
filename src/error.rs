//! Error types for the engine
//!
//! Errors are classified by recoverability:
//! - TransientStore: retried with bounded backoff, then the affected user is
//!   skipped for the current tick
//! - Delivery: non-fatal, the notification row is retained
//! - Configuration: fatal, but only at startup

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // Retryable
    #[error("Transient store error: {0}")]
    TransientStore(String),

    // Non-fatal per notification
    #[error("Delivery failed on channel '{channel}': {reason}")]
    Delivery { channel: String, reason: String },

    // Fatal at startup only
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl EngineError {
    /// Returns true if a bounded retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::TransientStore(_) => true,
            // SQLITE_BUSY surfaces as a plain rusqlite error under WAL
            EngineError::Store(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
            }
            _ => false,
        }
    }

    /// Returns true if the scheduler should keep the loop alive after
    /// logging this error. Everything except startup configuration is
    /// scoped to one user or one task.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Configuration(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// Maximum attempts for retryable store operations.
pub const MAX_STORE_ATTEMPTS: u32 = 3;

/// Run `op` up to [`MAX_STORE_ATTEMPTS`] times, sleeping between attempts
/// with a bounded linear backoff. Non-retryable errors return immediately.
pub async fn with_retry<T, F>(what: &str, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Result<T, EngineError>,
{
    let mut last_err = None;
    for attempt in 1..=MAX_STORE_ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_STORE_ATTEMPTS => {
                log::warn!(
                    "{} failed (attempt {}/{}), retrying: {}",
                    what,
                    attempt,
                    MAX_STORE_ATTEMPTS,
                    e
                );
                tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable while MAX_STORE_ATTEMPTS >= 1, but keep the compiler honest
    Err(last_err.unwrap_or_else(|| EngineError::TransientStore(format!("{} failed", what))))
}
