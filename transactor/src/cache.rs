//! In-memory balance cache
//!
//! Maps `user_id → ledger → Account` behind a single reader-writer lock.
//! Entries are loaded lazily: a miss pulls every account of that user from
//! storage in one call. Nothing is ever evicted.
//!
//! Hydration on miss is not deduplicated. Two concurrent misses for the same
//! user both hit storage; the second insert is a no-op because hydration only
//! fills absent entries. That rule also keeps a slow hydration from replacing
//! an entry the engine has already advanced.

use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::{Account, Ledger};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type AccountMap = HashMap<String, HashMap<Ledger, Account>>;

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from memory
    pub hits: AtomicU64,
    /// Lookups that went to storage
    pub misses: AtomicU64,
}

impl CacheStats {
    /// Percentage of lookups served from memory
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (hits as f64) / (total as f64) * 100.0
        }
    }
}

/// Account cache shared by the resolver and the engine
pub struct BalanceCache {
    accounts: RwLock<AccountMap>,
    storage: Arc<dyn Storage>,
    metrics: Metrics,
    stats: CacheStats,
}

impl BalanceCache {
    /// Create an empty cache over `storage`
    pub fn new(storage: Arc<dyn Storage>, metrics: Metrics) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            storage,
            metrics,
            stats: CacheStats::default(),
        }
    }

    /// Load every stored account, replacing whatever is resident
    pub async fn warm(&self) -> Result<usize> {
        let accounts = self.storage.get_all_accounts().await?;
        let count = accounts.len();

        let mut map = self.accounts.write();
        for account in accounts {
            map.entry(account.user_id.clone())
                .or_default()
                .insert(account.ledger, account);
        }
        drop(map);

        self.metrics.set_cached_accounts(self.len());
        tracing::info!(accounts = count, "Balance cache warmed");
        Ok(count)
    }

    /// Get the account for `(user_id, ledger)`, hydrating the user on a miss
    ///
    /// # Errors
    ///
    /// - [`Error::AccountNotFound`] if storage has no such account either.
    /// - Any storage error raised during hydration.
    pub async fn get(&self, user_id: &str, ledger: Ledger) -> Result<Account> {
        if let Some(account) = self.lookup(user_id, ledger) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(account);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        self.hydrate(user_id).await?;

        self.lookup(user_id, ledger)
            .ok_or_else(|| Error::AccountNotFound {
                user_id: user_id.to_string(),
                ledger,
            })
    }

    /// Replace the entry for `account`'s `(user_id, ledger)`
    pub fn put(&self, account: Account) {
        let mut map = self.accounts.write();
        map.entry(account.user_id.clone())
            .or_default()
            .insert(account.ledger, account);
    }

    /// Replace several entries under one write lock
    ///
    /// Readers see either none or all of `accounts` applied.
    pub fn put_all(&self, accounts: impl IntoIterator<Item = Account>) {
        let mut map = self.accounts.write();
        for account in accounts {
            map.entry(account.user_id.clone())
                .or_default()
                .insert(account.ledger, account);
        }
    }

    /// Resident account, without touching storage
    pub fn lookup(&self, user_id: &str, ledger: Ledger) -> Option<Account> {
        self.accounts
            .read()
            .get(user_id)
            .and_then(|ledgers| ledgers.get(&ledger))
            .cloned()
    }

    /// Number of resident accounts
    pub fn len(&self) -> usize {
        self.accounts.read().values().map(HashMap::len).sum()
    }

    /// Whether no account is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    async fn hydrate(&self, user_id: &str) -> Result<()> {
        // Fetch outside the lock; concurrent readers keep going meanwhile
        let accounts = self.storage.get_user_accounts(user_id).await?;
        self.metrics.record_cache_hydration();

        let mut map = self.accounts.write();
        let ledgers = map.entry(user_id.to_string()).or_default();
        for account in accounts {
            ledgers.entry(account.ledger).or_insert(account);
        }
        drop(map);

        self.metrics.set_cached_accounts(self.len());
        tracing::debug!(user_id, "Hydrated user accounts");
        Ok(())
    }
}
