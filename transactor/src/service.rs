//! RPC surface
//!
//! [`TransactorService`] exposes the transactor as async handlers that fail
//! with [`tonic::Status`], ready to be mounted behind any transport.

use crate::transactor::Transactor;
use crate::types::{Account, CompletedTransfer, Ledger, Page, TransferEvent, TransferRequest};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

/// Transactions service
#[derive(Clone)]
pub struct TransactorService {
    transactor: Arc<Transactor>,
}

impl TransactorService {
    /// Create new service
    pub fn new(transactor: Arc<Transactor>) -> Self {
        Self { transactor }
    }

    /// Balance of a user's account as a decimal string
    pub async fn get_balance(
        &self,
        user_id: &str,
        ledger: Ledger,
        create_if_not_exists: bool,
    ) -> Result<String, Status> {
        Ok(self
            .transactor
            .get_balance(user_id, ledger, create_if_not_exists)
            .await?)
    }

    /// Account of a user on one ledger
    pub async fn account_get_via_user(
        &self,
        user_id: &str,
        ledger: Ledger,
    ) -> Result<Account, Status> {
        Ok(self.transactor.account(user_id, ledger).await?)
    }

    /// Accounts of a user on every ledger, creating those requested
    pub async fn accounts_user(
        &self,
        user_id: &str,
        create_if_not_exist: &[Ledger],
    ) -> Result<Vec<Account>, Status> {
        Ok(self
            .transactor
            .accounts_user(user_id, create_if_not_exist)
            .await?)
    }

    /// Record a transfer
    pub async fn transact(&self, request: TransferRequest) -> Result<CompletedTransfer, Status> {
        Ok(self.transactor.transact(request).await?)
    }

    /// Record a transfer under a pre-generated id
    pub async fn transact_with_id(
        &self,
        request: TransferRequest,
        tx_id: &str,
    ) -> Result<CompletedTransfer, Status> {
        Ok(self.transactor.transact_with_id(request, tx_id).await?)
    }

    /// Stream of completed transfers, ending when `cancel` fires
    pub fn transfer_complete_subscribe(
        &self,
        subscriber_id: &str,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TransferEvent>, Status> {
        Ok(self.transactor.subscribe(subscriber_id, cancel)?)
    }

    /// Look up a transfer by id
    pub async fn transaction_get_by_id(&self, tx_id: &str) -> Result<CompletedTransfer, Status> {
        let id = parse_uuid(tx_id, "transaction id")?;
        Ok(self.transactor.transfer(id).await?)
    }

    /// Page through an account's transfers; returns the total alongside the page
    pub async fn transactions_get_by_account(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<(usize, Vec<CompletedTransfer>), Status> {
        let id = parse_uuid(account_id, "account id")?;
        Ok(self.transactor.history(id, page).await?)
    }
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| Status::invalid_argument(format!("invalid {} {:?}: {}", what, raw, e)))
}
