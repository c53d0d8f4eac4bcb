//! In-memory storage backend

use super::{paginate, Storage};
use crate::types::{Account, AccountCode, CompletedTransfer, Ledger, Page, Transfer};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    by_owner: HashMap<(String, Ledger), Uuid>,
    /// Insertion order doubles as timestamp order
    transfers: Vec<Transfer>,
    transfer_index: HashMap<Uuid, usize>,
}

impl MemoryState {
    fn complete(&self, transfer: &Transfer) -> Result<CompletedTransfer> {
        let debit = self.owner_of(transfer.debit_account_id)?;
        let credit = self.owner_of(transfer.credit_account_id)?;
        Ok(CompletedTransfer::from_transfer(transfer, debit, credit))
    }

    fn owner_of(&self, account_id: Uuid) -> Result<&str> {
        self.account(account_id).map(|account| account.user_id.as_str())
    }

    fn account(&self, account_id: Uuid) -> Result<&Account> {
        self.accounts
            .get(&account_id)
            .ok_or_else(|| Error::Persistence(format!("unknown account {}", account_id)))
    }
}

/// Storage backed by process-local maps
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed account, e.g. one carrying imported balances
    pub fn insert_account(&self, mut account: Account) -> Result<()> {
        let mut state = self.state.lock();
        let owner = (account.user_id.clone(), account.ledger);
        if state.by_owner.contains_key(&owner) {
            return Err(Error::AccountExists {
                user_id: account.user_id,
                ledger: account.ledger,
            });
        }
        account.recompute_balance();
        state.by_owner.insert(owner, account.id);
        state.accounts.insert(account.id, account);
        Ok(())
    }

    /// Number of recorded transfers
    pub fn transfer_count(&self) -> usize {
        self.state.lock().transfers.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_all_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.lock().accounts.values().cloned().collect())
    }

    async fn get_user_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        let state = self.state.lock();
        Ok(Ledger::ALL
            .iter()
            .filter_map(|ledger| state.by_owner.get(&(user_id.to_string(), *ledger)))
            .filter_map(|id| state.accounts.get(id))
            .cloned()
            .collect())
    }

    async fn create_account(
        &self,
        user_id: &str,
        code: AccountCode,
        ledger: Ledger,
    ) -> Result<()> {
        self.insert_account(Account::new(user_id, code, ledger))
    }

    async fn insert_transfer(&self, transfer: &Transfer) -> Result<()> {
        let mut state = self.state.lock();

        if state.transfer_index.contains_key(&transfer.id) {
            return Err(Error::DuplicateTransfer(transfer.id));
        }
        if transfer.debit_account_id == transfer.credit_account_id {
            return Err(Error::InvalidArgument(
                "debit and credit account must differ".to_string(),
            ));
        }

        // Post on copies so an overflow on either side changes nothing
        let mut debit = state.account(transfer.debit_account_id)?.clone();
        let mut credit = state.account(transfer.credit_account_id)?.clone();
        debit.post_debit(transfer.amount)?;
        credit.post_credit(transfer.amount)?;

        state.accounts.insert(debit.id, debit);
        state.accounts.insert(credit.id, credit);

        let position = state.transfers.len();
        state.transfers.push(transfer.clone());
        state.transfer_index.insert(transfer.id, position);
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<CompletedTransfer> {
        let state = self.state.lock();
        let position = state
            .transfer_index
            .get(&transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;
        state.complete(&state.transfers[*position])
    }

    async fn get_account_transfers(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<(usize, Vec<CompletedTransfer>)> {
        let state = self.state.lock();
        let matching: Vec<(u64, Transfer)> = state
            .transfers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.debit_account_id == account_id || t.credit_account_id == account_id)
            .map(|(position, t)| (position as u64, t.clone()))
            .collect();
        let total = matching.len();

        let results = paginate(matching, &page)
            .iter()
            .map(|transfer| state.complete(transfer))
            .collect::<Result<Vec<_>>>()?;

        Ok((total, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SortDirection, TransferCode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn transfer(debit: &Account, credit: &Account, amount: Decimal) -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            debit_account_id: debit.id,
            credit_account_id: credit.id,
            amount,
            ledger: debit.ledger,
            code: TransferCode(1),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    async fn two_accounts(storage: &MemoryStorage) -> (Account, Account) {
        storage
            .create_account("alice", AccountCode::User, Ledger::Sups)
            .await
            .unwrap();
        storage
            .create_account("bob", AccountCode::User, Ledger::Sups)
            .await
            .unwrap();
        let alice = storage.get_user_accounts("alice").await.unwrap().remove(0);
        let bob = storage.get_user_accounts("bob").await.unwrap().remove(0);
        (alice, bob)
    }

    #[tokio::test]
    async fn test_one_account_per_user_and_ledger() {
        let storage = MemoryStorage::new();
        storage
            .create_account("alice", AccountCode::User, Ledger::Sups)
            .await
            .unwrap();

        let err = storage
            .create_account("alice", AccountCode::User, Ledger::Sups)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountExists { .. }));

        storage
            .create_account("alice", AccountCode::User, Ledger::Usd)
            .await
            .unwrap();
        assert_eq!(storage.get_user_accounts("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_transfer_posts_both_sides() {
        let storage = MemoryStorage::new();
        let (alice, bob) = two_accounts(&storage).await;

        storage
            .insert_transfer(&transfer(&alice, &bob, dec!(12.5)))
            .await
            .unwrap();

        let alice = storage.get_user_accounts("alice").await.unwrap().remove(0);
        let bob = storage.get_user_accounts("bob").await.unwrap().remove(0);
        assert_eq!(alice.debits_posted, dec!(12.5));
        assert_eq!(alice.balance, dec!(-12.5));
        assert_eq!(bob.credits_posted, dec!(12.5));
        assert_eq!(bob.balance, dec!(12.5));
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected_without_side_effects() {
        let storage = MemoryStorage::new();
        let (alice, bob) = two_accounts(&storage).await;
        let t = transfer(&alice, &bob, dec!(1));

        storage.insert_transfer(&t).await.unwrap();
        let err = storage.insert_transfer(&t).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTransfer(id) if id == t.id));

        let bob = storage.get_user_accounts("bob").await.unwrap().remove(0);
        assert_eq!(bob.balance, dec!(1));
        assert_eq!(storage.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_transfer_history_paging() {
        let storage = MemoryStorage::new();
        let (alice, bob) = two_accounts(&storage).await;

        let mut ids = Vec::new();
        for i in 1..=5 {
            let t = transfer(&alice, &bob, Decimal::from(i));
            ids.push(t.id);
            storage.insert_transfer(&t).await.unwrap();
        }

        let newest_first = Page {
            offset: 0,
            limit: 2,
            ..Page::default()
        };
        let (total, newest) = storage
            .get_account_transfers(bob.id, newest_first)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(newest.iter().map(|t| t.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let oldest_first = Page {
            offset: 1,
            limit: 10,
            direction: SortDirection::Asc,
            ..Page::default()
        };
        let (_, oldest) = storage
            .get_account_transfers(alice.id, oldest_first)
            .await
            .unwrap();
        assert_eq!(oldest.len(), 4);
        assert_eq!(oldest[0].id, ids[1]);
        assert_eq!(oldest[0].debit_user_id, "alice");
    }

    #[tokio::test]
    async fn test_history_sorted_by_column() {
        let storage = MemoryStorage::new();
        let (alice, bob) = two_accounts(&storage).await;

        for amount in [dec!(3), dec!(1), dec!(2)] {
            storage
                .insert_transfer(&transfer(&alice, &bob, amount))
                .await
                .unwrap();
        }

        let by_amount = Page::from_request(0, 10, "amount", "asc");
        let (_, page) = storage.get_account_transfers(bob.id, by_amount).await.unwrap();
        let amounts: Vec<&str> = page.iter().map(|t| t.amount.as_str()).collect();
        assert_eq!(amounts, vec!["1", "2", "3"]);

        let by_amount_desc = Page::from_request(0, 10, "amount", "desc");
        let (_, page) = storage.get_account_transfers(bob.id, by_amount_desc).await.unwrap();
        let amounts: Vec<&str> = page.iter().map(|t| t.amount.as_str()).collect();
        assert_eq!(amounts, vec!["3", "2", "1"]);

        // Unknown column falls back to newest first
        let fallback = Page::from_request(0, 10, "nonsense", "asc");
        let (_, page) = storage.get_account_transfers(bob.id, fallback).await.unwrap();
        let amounts: Vec<&str> = page.iter().map(|t| t.amount.as_str()).collect();
        assert_eq!(amounts, vec!["2", "1", "3"]);
    }

    #[tokio::test]
    async fn test_overflowing_transfer_changes_nothing() {
        let storage = MemoryStorage::new();
        let (alice, bob) = two_accounts(&storage).await;

        // Credit side overflows on the second transfer; debit side would not
        let mut carol = Account::new("carol", AccountCode::User, Ledger::Sups);
        carol.credits_posted = Decimal::MAX;
        storage.insert_account(carol.clone()).unwrap();
        storage
            .insert_transfer(&transfer(&alice, &bob, dec!(1)))
            .await
            .unwrap();

        let err = storage
            .insert_transfer(&transfer(&alice, &carol, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let alice = storage.get_user_accounts("alice").await.unwrap().remove(0);
        assert_eq!(alice.debits_posted, dec!(1));
        assert_eq!(storage.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_get_transfer_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.get_transfer(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::TransferNotFound(_)));
    }
}
