//! Error types for the escrow relayer

use crate::events::Chain;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error on {chain}: {message}")]
    Connection { chain: Chain, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid settlement data: {0}")]
    Validation(String),

    #[error("Settlement execution failed: {0}")]
    Execution(String),

    #[error("No intersection found on {chain}")]
    IntersectionNotFound { chain: Chain },

    #[error("Settlement {id} not found")]
    SettlementNotFound { id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Shorthand for a connection failure on `chain`
    pub fn connection(chain: Chain, message: impl ToString) -> Self {
        RelayerError::Connection {
            chain,
            message: message.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Connection { .. }
                | RelayerError::Execution(_)
                | RelayerError::IntersectionNotFound { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::IntersectionNotFound { .. } | RelayerError::Internal(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
