//! Error taxonomy shared by the stores, the optimizer and the fallback layer

use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Refused, reset, broken pipe, too many connections, busy or locked.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store cannot serve this operation (unreachable or lacking spatial support).
    #[error("capability unavailable: {0}")]
    Capability(String),

    #[error("both stores unavailable (primary: {primary}; secondary: {secondary})")]
    BothUnavailable { primary: String, secondary: String },

    #[error("internal store error: {0}")]
    Internal(String),
}

/// Message fragments that mark a driver failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "too many connections",
    "timeout",
    "timed out",
    "database is locked",
    "database is busy",
    "unable to open",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connectivity,
    Data,
    Capability,
    Internal,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Connectivity(_) | StoreError::Timeout { .. } => ErrorClass::Connectivity,
            StoreError::NotFound(_) | StoreError::Constraint(_) | StoreError::InvalidArgument(_) => {
                ErrorClass::Data
            }
            StoreError::Capability(_) | StoreError::BothUnavailable { .. } => ErrorClass::Capability,
            StoreError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Only connectivity-class failures are retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// Whether this failure should demote the primary for routing purposes.
    pub fn is_availability_failure(&self) -> bool {
        matches!(self.class(), ErrorClass::Connectivity | ErrorClass::Capability)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub(crate) fn not_connected(store: &str) -> Self {
        StoreError::Connectivity(format!("{} is not connected", store))
    }

    /// Classify a free-form driver message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            StoreError::Connectivity(message)
        } else {
            StoreError::Internal(message)
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::ConstraintViolation => StoreError::Constraint(err.to_string()),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase => StoreError::Connectivity(err.to_string()),
                _ => StoreError::from_message(err.to_string()),
            },
            _ => StoreError::from_message(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Connectivity(format!("connection pool: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Internal(format!("serialization: {}", err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Internal(format!("blocking task failed: {}", err))
    }
}
