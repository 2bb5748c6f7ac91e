//! Custody Error Types

use thiserror::Error;

use crate::module::ModuleError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Session invalidated")]
    SessionInvalidated,

    #[error("Unexpected signature format: {0}")]
    SignatureFormat(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModuleError> for CustodyError {
    fn from(e: ModuleError) -> Self {
        match e {
            ModuleError::SessionInvalid => CustodyError::SessionInvalidated,
            other => CustodyError::Internal(other.to_string()),
        }
    }
}
