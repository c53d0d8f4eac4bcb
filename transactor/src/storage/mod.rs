//! Persistence gateway
//!
//! The engine only talks to durable state through the [`Storage`] trait.
//! Two backends ship with the crate:
//!
//! - [`RocksStorage`] - RocksDB column families with atomic write batches
//! - [`MemoryStorage`] - process-local maps, for tests and local runs
//!
//! # Contract
//!
//! - `insert_transfer` is atomic: the transfer row and both account
//!   accumulators are written together or not at all.
//! - A transfer id is recorded at most once; a second insert fails with
//!   [`Error::DuplicateTransfer`](crate::Error::DuplicateTransfer).
//! - At most one account exists per `(user_id, ledger)`.
//! - Accounts returned by reads always carry a balance recomputed from
//!   `credits_posted - debits_posted`.

mod memory;
mod rocks;

pub use memory::MemoryStorage;
pub use rocks::RocksStorage;

use crate::types::{
    Account, AccountCode, CompletedTransfer, Ledger, Page, SortColumn, SortDirection, Transfer,
};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Durable store for accounts and transfers
#[async_trait]
pub trait Storage: Send + Sync {
    /// Every account in the store
    async fn get_all_accounts(&self) -> Result<Vec<Account>>;

    /// Every account owned by `user_id`, across ledgers
    async fn get_user_accounts(&self, user_id: &str) -> Result<Vec<Account>>;

    /// Create an empty account for `(user_id, ledger)`
    async fn create_account(&self, user_id: &str, code: AccountCode, ledger: Ledger)
        -> Result<()>;

    /// Record a transfer and advance both accounts' accumulators
    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()>;

    /// Look up a recorded transfer
    async fn get_transfer(&self, transfer_id: Uuid) -> Result<CompletedTransfer>;

    /// Transfers touching `account_id` on either side, with the total count
    async fn get_account_transfers(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<(usize, Vec<CompletedTransfer>)>;
}

/// Order an account's history for `page` and cut out the requested window
///
/// Each transfer comes with its recording sequence number, which breaks
/// ties between equal column values (transfers stamped within one second).
pub(crate) fn paginate(mut entries: Vec<(u64, Transfer)>, page: &Page) -> Vec<Transfer> {
    entries.sort_by(|(seq_a, a), (seq_b, b)| {
        let ordering = match page.sort_by {
            SortColumn::CreatedAt => a.timestamp.cmp(&b.timestamp),
            SortColumn::Id => a.id.cmp(&b.id),
            SortColumn::Amount => a.amount.cmp(&b.amount),
            SortColumn::DebitAccount => a.debit_account_id.cmp(&b.debit_account_id),
            SortColumn::CreditAccount => a.credit_account_id.cmp(&b.credit_account_id),
            SortColumn::Ledger => a.ledger.code().cmp(&b.ledger.code()),
            SortColumn::TransferCode => a.code.0.cmp(&b.code.0),
        }
        .then_with(|| seq_a.cmp(seq_b));

        match page.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });

    entries
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .map(|(_, transfer)| transfer)
        .collect()
}
