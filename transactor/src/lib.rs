//! Transactor
//!
//! Double-entry ledger core: per-user, per-ledger balances, atomic transfers
//! and a live feed of completed transfers.
//!
//! # Architecture
//!
//! - **Single Writer**: one engine task applies every transfer, in admission order
//! - **Balance Cache**: accounts loaded lazily from storage and never evicted
//! - **Broadcast**: completed transfers fan out to subscribers, at most once
//! - **Pluggable Storage**: RocksDB in production, in-memory for tests
//!
//! # Invariants
//!
//! - Conservation: every transfer debits and credits the same amount
//! - Serializability: the result equals some sequential order of submissions
//! - Immutability: recorded transfers are never modified or deleted

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod resolver;
pub mod service;
pub mod storage;
pub mod transactor;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use service::TransactorService;
pub use crate::transactor::Transactor;
pub use types::{
    Account, AccountCode, CompletedTransfer, Ledger, Page, SortColumn, SortDirection,
    Transfer, TransferCode, TransferEvent, TransferRequest,
};
