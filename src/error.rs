//! Operation error taxonomy shared by the registry and scan surfaces.

use crate::store::StoreError;

/// Errors surfaced synchronously to API callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Validation failure (canonical id format, missing field, bad payload).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Uniqueness violation.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Unknown id or canonical id.
    #[error("not found")]
    NotFound,
    /// Request carries no authenticated principal.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Caller lacks the role or team membership for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Operation not permitted from the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Scheduler or scanner failure; fatal to the scan, not the registry.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { field } => GatewayError::Conflict(field),
            StoreError::Unavailable(msg) => GatewayError::Internal(msg),
            StoreError::Corrupt(msg) => GatewayError::Internal(msg),
        }
    }
}
