//! Error types for Wardex.
//!
//! Defines a unified error type for fallible operations. The shield itself
//! never surfaces these from `evaluate` (every failure path folds into a
//! synthetic verdict); they appear at the edges: configuration, the signer
//! protocol, key handling, and session management.

use thiserror::Error;

/// Unified error type for Wardex operations.
#[derive(Debug, Error)]
pub enum WardexError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy rejected: {0}")]
    Policy(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Signer request timed out after {0} seconds")]
    SignerTimeout(u64),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Wardex operations.
pub type WardexResult<T> = Result<T, WardexError>;
