//! Transactor orchestration layer
//!
//! Ties the storage backend, balance cache, resolver, engine and broadcast
//! hub into one high-level API.
//!
//! # Example
//!
//! ```no_run
//! use transactor::{Config, Ledger, Transactor, TransferCode, TransferRequest};
//!
//! #[tokio::main]
//! async fn main() -> transactor::Result<()> {
//!     let transactor = Transactor::open(Config::default()).await?;
//!
//!     let transfer = transactor
//!         .transact(TransferRequest {
//!             credit_user_id: "alice".to_string(),
//!             debit_user_id: "treasury".to_string(),
//!             ledger: Ledger::Sups,
//!             amount: "30".to_string(),
//!             code: TransferCode(1),
//!         })
//!         .await?;
//!     println!("recorded {}", transfer.id);
//!
//!     transactor.close().await;
//!     Ok(())
//! }
//! ```

use crate::broadcast::{spawn_broadcast_hub, BroadcastHub};
use crate::cache::BalanceCache;
use crate::engine::{spawn_engine, EngineHandle, TransferWork};
use crate::metrics::Metrics;
use crate::resolver::AccountResolver;
use crate::storage::{RocksStorage, Storage};
use crate::types::{
    Account, CompletedTransfer, Ledger, Page, TransferEvent, TransferRequest,
};
use crate::{Config, Error, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Main transactor interface
pub struct Transactor {
    engine: EngineHandle,
    resolver: AccountResolver,
    cache: Arc<BalanceCache>,
    storage: Arc<dyn Storage>,
    hub: BroadcastHub,
    metrics: Metrics,

    /// Engine and dispatcher tasks, taken on close
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Transactor {
    /// Open a transactor backed by RocksDB under `config.data_dir`
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(RocksStorage::open(&config)?);
        Self::with_storage(config, storage).await
    }

    /// Build a transactor over an existing storage backend
    ///
    /// Every stored account is loaded into the cache before the engine
    /// starts accepting work.
    pub async fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new()?;

        let cache = Arc::new(BalanceCache::new(storage.clone(), metrics.clone()));
        cache.warm().await?;

        let resolver = AccountResolver::new(cache.clone(), storage.clone());
        let (hub, dispatcher) = spawn_broadcast_hub(&config.broadcast, metrics.clone());
        let (engine, engine_task) = spawn_engine(
            &config.engine,
            storage.clone(),
            cache.clone(),
            hub.clone(),
            metrics.clone(),
        );

        tracing::info!(
            service = %config.service_name,
            queue_capacity = config.engine.queue_capacity,
            event_capacity = config.broadcast.event_capacity,
            "Transactor started"
        );

        Ok(Self {
            engine,
            resolver,
            cache,
            storage,
            hub,
            metrics,
            tasks: Mutex::new(Some((engine_task, dispatcher))),
        })
    }

    /// Balance of `(user_id, ledger)` as an exact decimal string
    pub async fn get_balance(
        &self,
        user_id: &str,
        ledger: Ledger,
        create_if_not_exists: bool,
    ) -> Result<String> {
        require_user_id(user_id, "user id")?;
        let account = self
            .resolver
            .resolve(user_id, ledger, create_if_not_exists)
            .await?;
        Ok(account.balance_string())
    }

    /// Look up an existing account
    pub async fn account(&self, user_id: &str, ledger: Ledger) -> Result<Account> {
        require_user_id(user_id, "user id")?;
        self.resolver.resolve(user_id, ledger, false).await
    }

    /// The user's accounts across every ledger, provisioning those in `create`
    pub async fn accounts_user(&self, user_id: &str, create: &[Ledger]) -> Result<Vec<Account>> {
        require_user_id(user_id, "user id")?;
        self.resolver.resolve_all(user_id, create).await
    }

    /// Move value between two users, creating the credit account if needed
    pub async fn transact(&self, request: TransferRequest) -> Result<CompletedTransfer> {
        self.execute(request, None, true).await
    }

    /// Move value under a caller-chosen transfer id
    ///
    /// Both accounts must already exist. `transfer_id` must be a UUID that has
    /// not been recorded before.
    pub async fn transact_with_id(
        &self,
        request: TransferRequest,
        transfer_id: &str,
    ) -> Result<CompletedTransfer> {
        self.execute(request, Some(transfer_id), false).await
    }

    /// Look up a recorded transfer
    pub async fn transfer(&self, transfer_id: Uuid) -> Result<CompletedTransfer> {
        self.storage.get_transfer(transfer_id).await
    }

    /// Transfers touching `account_id`, with the total before paging
    pub async fn history(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<(usize, Vec<CompletedTransfer>)> {
        if page.limit == 0 {
            return Err(Error::InvalidArgument("page limit must be positive".to_string()));
        }
        self.storage.get_account_transfers(account_id, page).await
    }

    /// Stream completed transfers until `cancel` fires or the stream is dropped
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TransferEvent>> {
        require_user_id(subscriber_id, "subscriber id")?;
        Ok(self.hub.subscribe(subscriber_id, cancel))
    }

    /// Shared balance cache
    pub fn cache(&self) -> &BalanceCache {
        &self.cache
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop accepting work, finish everything queued, end subscriptions
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let tasks = self.tasks.lock().take();
        let Some((engine_task, dispatcher)) = tasks else {
            return;
        };

        self.engine.shutdown().await;
        if let Err(e) = engine_task.await {
            tracing::error!(error = %e, "Engine task failed");
        }

        self.hub.shutdown();
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Broadcast task failed");
        }

        tracing::info!("Transactor closed");
    }

    async fn execute(
        &self,
        request: TransferRequest,
        transfer_id: Option<&str>,
        create_credit: bool,
    ) -> Result<CompletedTransfer> {
        require_user_id(&request.credit_user_id, "credit user id")?;
        require_user_id(&request.debit_user_id, "debit user id")?;
        if request.credit_user_id == request.debit_user_id {
            return Err(Error::InvalidArgument(
                "credit and debit user must differ".to_string(),
            ));
        }

        let credit = self
            .resolver
            .resolve(&request.credit_user_id, request.ledger, create_credit)
            .await?;
        let debit = self
            .resolver
            .resolve(&request.debit_user_id, request.ledger, false)
            .await?;

        let amount = parse_amount(&request.amount)?;

        let id = match transfer_id {
            Some(raw) => Uuid::parse_str(raw.trim()).map_err(|e| {
                Error::InvalidArgument(format!("invalid transfer id {:?}: {}", raw, e))
            })?,
            None => Uuid::new_v4(),
        };

        self.engine
            .submit(TransferWork {
                id,
                debit,
                credit,
                amount,
                code: request.code,
            })
            .await
    }
}

fn require_user_id(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{} is empty", what)));
    }
    Ok(())
}

/// Parse a strictly positive exact decimal
fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(raw.trim())
        .map_err(|e| Error::InvalidArgument(format!("invalid amount {:?}: {}", raw, e)))?;
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidArgument(format!(
            "amount must be positive, got {}",
            raw
        )));
    }
    Ok(amount)
}
