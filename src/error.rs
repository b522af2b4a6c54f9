//! Error taxonomy for order capture and sync.
//!
//! Foreground errors (`Validation`, `StorageUnavailable`, `FiscalSigning`)
//! are returned to the caller of the session controller. Background errors
//! (`TransientSync`, `PermanentSyncRejection`, `Conflict`) are produced by the
//! dispatcher, logged, and exposed through the sync status snapshot instead of
//! being propagated.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PosError {
    /// An action was attempted against an order in a state that forbids it.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local durable store I/O failed. The mutation is still held in memory.
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Network, timeout or server-side failure. Retried with backoff.
    #[error("Transient sync failure: {0}")]
    TransientSync(String),

    /// The remote system explicitly rejected an operation as invalid.
    #[error("Sync operation {operation_id} permanently rejected: {reason}")]
    PermanentSyncRejection { operation_id: String, reason: String },

    /// The remote system reported a conflicting concurrent edit.
    #[error("Sync conflict for order {order_id}: {reason}")]
    Conflict { order_id: String, reason: String },

    /// The fiscal collaborator did not produce a signature.
    #[error("Fiscal signing failed: {0}")]
    FiscalSigning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PosError {
    /// Transient failures are retried automatically; everything else needs a
    /// caller decision.
    pub fn is_transient(&self) -> bool {
        matches!(self, PosError::TransientSync(_))
    }
}

impl From<rusqlite::Error> for PosError {
    fn from(err: rusqlite::Error) -> Self {
        PosError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(err: serde_json::Error) -> Self {
        PosError::StorageUnavailable(format!("document encoding: {err}"))
    }
}

impl From<reqwest::Error> for PosError {
    fn from(err: reqwest::Error) -> Self {
        PosError::TransientSync(err.to_string())
    }
}

pub type PosResult<T> = Result<T, PosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_sync_is_retryable() {
        assert!(PosError::TransientSync("HTTP 503".into()).is_transient());
        assert!(!PosError::StorageUnavailable("disk full".into()).is_transient());
        assert!(!PosError::PermanentSyncRejection {
            operation_id: "o1:1".into(),
            reason: "malformed".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_sqlite_errors_map_to_storage_unavailable() {
        let err: PosError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, PosError::StorageUnavailable(_)));
    }
}
