//! Get-or-create account lookup on top of the balance cache

use crate::cache::BalanceCache;
use crate::storage::Storage;
use crate::types::{Account, AccountCode, Ledger};
use crate::{Error, Result};
use std::sync::Arc;

/// Resolves `(user_id, ledger)` to an account, optionally provisioning it
pub struct AccountResolver {
    cache: Arc<BalanceCache>,
    storage: Arc<dyn Storage>,
}

impl AccountResolver {
    /// Create a resolver sharing `cache` with the engine
    pub fn new(cache: Arc<BalanceCache>, storage: Arc<dyn Storage>) -> Self {
        Self { cache, storage }
    }

    /// Resolve one account
    ///
    /// With `create_if_missing`, a missing account is created as a default
    /// [`AccountCode::User`] account and then read back through the cache.
    /// Without it, [`Error::AccountNotFound`] is returned unchanged.
    pub async fn resolve(
        &self,
        user_id: &str,
        ledger: Ledger,
        create_if_missing: bool,
    ) -> Result<Account> {
        match self.cache.get(user_id, ledger).await {
            Err(Error::AccountNotFound { .. }) if create_if_missing => {
                self.create(user_id, ledger).await?;
                self.cache.get(user_id, ledger).await
            }
            other => other,
        }
    }

    /// Resolve the user's account on every known ledger
    ///
    /// Ledgers listed in `create` are provisioned when missing. Any other
    /// ledger without an account is skipped; that is not an error.
    pub async fn resolve_all(&self, user_id: &str, create: &[Ledger]) -> Result<Vec<Account>> {
        let mut accounts = Vec::with_capacity(Ledger::ALL.len());
        for ledger in Ledger::ALL {
            match self.resolve(user_id, ledger, create.contains(&ledger)).await {
                Ok(account) => accounts.push(account),
                Err(Error::AccountNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(accounts)
    }

    async fn create(&self, user_id: &str, ledger: Ledger) -> Result<()> {
        match self
            .storage
            .create_account(user_id, AccountCode::User, ledger)
            .await
        {
            Ok(()) => {
                tracing::info!(user_id, %ledger, "Created account");
                Ok(())
            }
            // Lost a creation race; the winner's account is what we want
            Err(Error::AccountExists { .. }) => Ok(()),
            Err(e) => {
                tracing::error!(user_id, %ledger, error = %e, "Failed to create account");
                Err(e)
            }
        }
    }
}
