//! Error types for the transactor

use crate::types::Ledger;
use thiserror::Error;
use tonic::{Code, Status};
use uuid::Uuid;

/// Result type for transactor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transactor errors
#[derive(Error, Debug)]
pub enum Error {
    /// No account exists for the user on this ledger
    #[error("unable to find account for user {user_id} on ledger {ledger}")]
    AccountNotFound {
        /// Owner of the missing account
        user_id: String,
        /// Ledger that was looked up
        ledger: Ledger,
    },

    /// An account already exists for the user on this ledger
    #[error("account already exists for user {user_id} on ledger {ledger}")]
    AccountExists {
        /// Owner of the existing account
        user_id: String,
        /// Ledger of the existing account
        ledger: Ledger,
    },

    /// Engine queue is at capacity, retry with backoff
    #[error("transaction queue is full")]
    QueueFull,

    /// Engine no longer accepts work
    #[error("transaction engine is closed")]
    EngineClosed,

    /// Malformed request (amount, identifiers)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transfer id was already recorded
    #[error("duplicate transfer id: {0}")]
    DuplicateTransfer(Uuid),

    /// Transfer not found
    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    /// Storage backend failure
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::AccountNotFound { .. } | Error::TransferNotFound(_) => Code::NotFound,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}
