//! Dispatch error taxonomy
//!
//! `StoreError` is what persistence backends report; `DispatchError` is what
//! callers of the engine see. Transient store failures only reach callers as
//! `StoreUnavailable`, after the retry policy gave up.

use beacon_core::CoreError;
use thiserror::Error;

use crate::auth::AuthError;
use crate::geofence::GeofenceError;
use crate::types::ResponderClass;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Credential mismatch, unknown identity, or caller does not own the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown request or responder
    #[error("Not found: {0}")]
    NotFound(String),

    /// Search radius outside (0, max]
    #[error("Search radius {requested}m outside the allowed range (0, {max}]m")]
    RangeExceeded {
        /// Radius the caller asked for
        requested: f64,
        /// Configured maximum
        max: f64,
    },

    /// Another responder won the claim
    #[error("Request {request_id} already claimed by {claimant}")]
    AlreadyClaimed {
        /// Request identifier
        request_id: String,
        /// Responder holding the request
        claimant: String,
    },

    /// Mutation attempted on a resolved request
    #[error("Request {0} already resolved")]
    AlreadyResolved(String),

    /// Store kept failing after bounded retries
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Coordinate outside the valid range
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Operation does not apply to this class
    #[error("Operation not supported for class {0}")]
    InvalidClass(ResponderClass),

    /// Engine configuration rejected
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors reported by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend temporarily unreachable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded its deadline; outcome unknown
    #[error("Store call timed out: {0}")]
    Timeout(&'static str),

    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => DispatchError::NotFound(key),
            other => DispatchError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<GeofenceError> for DispatchError {
    fn from(err: GeofenceError) -> Self {
        match err {
            GeofenceError::RangeExceeded { requested, max } => {
                DispatchError::RangeExceeded { requested, max }
            }
        }
    }
}

impl From<AuthError> for DispatchError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(msg) | AuthError::InvalidDigest(msg) => {
                DispatchError::Unauthorized(msg)
            }
            AuthError::Unavailable(msg) => DispatchError::StoreUnavailable(msg),
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidCoordinate(msg) => DispatchError::InvalidPosition(msg),
            CoreError::InvalidConfig(msg) => DispatchError::Configuration(msg),
            CoreError::Io(e) => DispatchError::Configuration(e.to_string()),
        }
    }
}
