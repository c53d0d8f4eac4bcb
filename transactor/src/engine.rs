//! Single-writer transaction engine
//!
//! Every balance-mutating operation goes through one consumer task, so no
//! two transfers ever interleave.
//!
//! # Architecture
//!
//! ```text
//!   submitters ──EngineHandle (Clone)──► mpsc::channel (bounded)
//!                                              │
//!                                              ▼
//!                                   EngineActor (single task)
//!                                              │
//!                    ┌─────────────────────────┼─────────────────────────┐
//!                    ▼                         ▼                         ▼
//!          Storage::insert_transfer   BalanceCache::put_all    BroadcastHub::publish
//!                (persist)               (debit + credit)       (debit, then credit)
//! ```
//!
//! Admission is non-blocking: a full queue rejects with [`Error::QueueFull`]
//! instead of waiting. An accepted submitter waits on a oneshot for its own
//! result.

use crate::broadcast::BroadcastHub;
use crate::cache::BalanceCache;
use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::{Account, CompletedTransfer, Transfer, TransferCode, TransferEvent};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One transfer, resolved and validated, waiting to be applied
#[derive(Debug, Clone)]
pub struct TransferWork {
    /// Transfer id, unique across the store
    pub id: Uuid,
    /// Debit side as resolved by the caller
    pub debit: Account,
    /// Credit side as resolved by the caller
    pub credit: Account,
    /// Strictly positive amount
    pub amount: Decimal,
    /// Classification
    pub code: TransferCode,
}

/// Message sent to the engine
pub enum EngineMessage {
    /// Apply a transfer
    Execute {
        /// The transfer
        work: TransferWork,
        /// Receives this item's result
        response: oneshot::Sender<Result<CompletedTransfer>>,
    },

    /// Stop after everything queued before this message
    Shutdown {
        /// Signalled once the loop has exited
        done: oneshot::Sender<()>,
    },
}

/// The consumer side of the engine
pub struct EngineActor {
    mailbox: mpsc::Receiver<EngineMessage>,
    storage: Arc<dyn Storage>,
    cache: Arc<BalanceCache>,
    hub: BroadcastHub,
    metrics: Metrics,
}

impl EngineActor {
    /// Run until a shutdown message arrives or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!("Transaction engine started");
        let mut done = None;

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                EngineMessage::Execute { work, response } => {
                    let result = self.execute(work).await;
                    // Submitter may have gone away; the transfer still stands
                    let _ = response.send(result);
                }
                EngineMessage::Shutdown { done: ack } => {
                    done = Some(ack);
                    break;
                }
            }
        }

        // Anything queued after the shutdown message is dropped here, which
        // fails those submitters with EngineClosed.
        self.mailbox.close();
        drop(self.mailbox);

        tracing::info!("Transaction engine stopped");
        if let Some(ack) = done {
            let _ = ack.send(());
        }
    }

    async fn execute(&self, work: TransferWork) -> Result<CompletedTransfer> {
        let started = Instant::now();
        let TransferWork {
            id,
            debit,
            credit,
            amount,
            code,
        } = work;

        let transfer = Transfer {
            id,
            debit_account_id: debit.id,
            credit_account_id: credit.id,
            amount,
            ledger: debit.ledger,
            code,
            timestamp: Utc::now().timestamp(),
        };

        // Start from the resident entries: earlier items may have moved them
        // since the caller resolved its snapshot.
        let mut debit = self
            .cache
            .lookup(&debit.user_id, transfer.ledger)
            .unwrap_or(debit);
        let mut credit = self
            .cache
            .lookup(&credit.user_id, transfer.ledger)
            .unwrap_or(credit);

        let posted = debit
            .post_debit(amount)
            .and_then(|()| credit.post_credit(amount));
        let recorded = match posted {
            Ok(()) => self.storage.insert_transfer(&transfer).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            tracing::error!(
                transfer_id = %transfer.id,
                debit_user_id = %debit.user_id,
                credit_user_id = %credit.user_id,
                error = %e,
                "Failed to record transfer"
            );
            self.metrics.record_transfer_failure();
            return Err(e);
        }

        self.cache.put_all([debit.clone(), credit.clone()]);

        let completed =
            CompletedTransfer::from_transfer(&transfer, &debit.user_id, &credit.user_id);

        self.hub.publish(TransferEvent {
            account: debit,
            transfer: completed.clone(),
        });
        self.hub.publish(TransferEvent {
            account: credit,
            transfer: completed.clone(),
        });

        self.metrics.record_transfer(started.elapsed().as_secs_f64());
        tracing::debug!(
            transfer_id = %completed.id,
            amount = %completed.amount,
            ledger = %completed.ledger,
            "Transfer applied"
        );

        Ok(completed)
    }
}

/// Handle for submitting work to the engine
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineMessage>,
    metrics: Metrics,
}

impl EngineHandle {
    /// Submit a transfer and wait for its result
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] immediately if the queue is at capacity.
    /// - [`Error::EngineClosed`] if the engine has shut down, or shuts down
    ///   before reaching this item.
    /// - Whatever the persistence gateway returned for this item.
    pub async fn submit(&self, work: TransferWork) -> Result<CompletedTransfer> {
        let (tx, rx) = oneshot::channel();
        match self.sender.try_send(EngineMessage::Execute { work, response: tx }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_queue_full();
                tracing::warn!("Transaction queue full, rejecting submission");
                return Err(Error::QueueFull);
            }
            Err(TrySendError::Closed(_)) => return Err(Error::EngineClosed),
        }

        rx.await.map_err(|_| Error::EngineClosed)?
    }

    /// Items waiting in the queue, not counting the one executing
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Whether the engine has stopped accepting work
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Stop the engine after everything already queued has executed
    ///
    /// Waits for queue space rather than failing on a full queue. Calling
    /// this on a stopped engine is a no-op.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(EngineMessage::Shutdown { done: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

/// Build an engine without starting it
pub fn engine_channel(
    config: &EngineConfig,
    storage: Arc<dyn Storage>,
    cache: Arc<BalanceCache>,
    hub: BroadcastHub,
    metrics: Metrics,
) -> (EngineActor, EngineHandle) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let actor = EngineActor {
        mailbox: rx,
        storage,
        cache,
        hub,
        metrics: metrics.clone(),
    };
    (actor, EngineHandle { sender: tx, metrics })
}

/// Spawn the engine's consumer task
pub fn spawn_engine(
    config: &EngineConfig,
    storage: Arc<dyn Storage>,
    cache: Arc<BalanceCache>,
    hub: BroadcastHub,
    metrics: Metrics,
) -> (EngineHandle, JoinHandle<()>) {
    let (actor, handle) = engine_channel(config, storage, cache, hub, metrics);
    let task = tokio::spawn(actor.run());
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::spawn_broadcast_hub;
    use crate::config::BroadcastConfig;
    use crate::storage::testing::{FlakyStorage, GatedStorage};
    use crate::storage::MemoryStorage;
    use crate::types::{AccountCode, Ledger, Page, SortDirection};
    use rust_decimal_macros::dec;
    use tokio::time::{sleep, timeout, Duration};
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    struct Fixture<S: Storage + 'static> {
        storage: Arc<S>,
        cache: Arc<BalanceCache>,
        hub: BroadcastHub,
        metrics: Metrics,
    }

    fn fixture<S: Storage + 'static>(storage: S) -> Fixture<S> {
        let metrics = Metrics::new().unwrap();
        let storage = Arc::new(storage);
        let cache = Arc::new(BalanceCache::new(storage.clone(), metrics.clone()));
        let (hub, _task) = spawn_broadcast_hub(&BroadcastConfig::default(), metrics.clone());
        Fixture {
            storage,
            cache,
            hub,
            metrics,
        }
    }

    impl<S: Storage + 'static> Fixture<S> {
        fn engine(&self, capacity: usize) -> (EngineActor, EngineHandle) {
            engine_channel(
                &EngineConfig {
                    queue_capacity: capacity,
                },
                self.storage.clone(),
                self.cache.clone(),
                self.hub.clone(),
                self.metrics.clone(),
            )
        }

        async fn account(&self, user_id: &str) -> Account {
            self.storage
                .create_account(user_id, AccountCode::User, Ledger::Sups)
                .await
                .unwrap();
            self.cache.get(user_id, Ledger::Sups).await.unwrap()
        }
    }

    fn work(debit: &Account, credit: &Account, amount: Decimal) -> TransferWork {
        TransferWork {
            id: Uuid::new_v4(),
            debit: debit.clone(),
            credit: credit.clone(),
            amount,
            code: TransferCode(1),
        }
    }

    async fn wait_until_queued(handle: &EngineHandle, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while handle.queued() != expected {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("queue never reached expected depth");
    }

    #[tokio::test]
    async fn test_transfer_updates_cache_and_publishes_both_sides() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;
        let mut events = fx.hub.subscribe("watcher", CancellationToken::new());

        let (actor, handle) = fx.engine(8);
        tokio::spawn(actor.run());

        let completed = handle.submit(work(&bank, &alice, dec!(30))).await.unwrap();
        assert_eq!(completed.amount, "30");
        assert_eq!(completed.debit_user_id, "bank");
        assert_eq!(completed.credit_user_id, "alice");

        assert_eq!(fx.cache.lookup("bank", Ledger::Sups).unwrap().balance_string(), "-30");
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "30");
        assert_eq!(fx.storage.transfer_count(), 1);

        let first = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(first.account.user_id, "bank");
        assert_eq!(second.account.user_id, "alice");
        assert_eq!(first.transfer.id, completed.id);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_snapshots_do_not_lose_updates() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        let (actor, handle) = fx.engine(8);
        tokio::spawn(actor.run());

        // Both items carry the same zero-balance snapshot
        handle.submit(work(&bank, &alice, dec!(10))).await.unwrap();
        handle.submit(work(&bank, &alice, dec!(5))).await.unwrap();

        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "15");
        assert_eq!(fx.cache.lookup("bank", Ledger::Sups).unwrap().balance_string(), "-15");
    }

    #[tokio::test]
    async fn test_items_execute_in_admission_order() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        // Queue everything before the consumer starts
        let (actor, handle) = fx.engine(16);
        let mut ids = Vec::new();
        let mut pending = Vec::new();
        for i in 1..=10 {
            let item = work(&bank, &alice, Decimal::from(i));
            ids.push(item.id);
            let submitter = handle.clone();
            pending.push(tokio::spawn(async move { submitter.submit(item).await }));
            wait_until_queued(&handle, i as usize).await;
        }

        tokio::spawn(actor.run());
        for task in pending {
            task.await.unwrap().unwrap();
        }

        let page = Page {
            limit: 100,
            direction: SortDirection::Asc,
            ..Page::default()
        };
        let (total, history) = fx.storage.get_account_transfers(alice.id, page).await.unwrap();
        assert_eq!(total, 10);
        let recorded: Vec<Uuid> = history.iter().map(|t| t.id).collect();
        assert_eq!(recorded, ids);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        // Consumer not running: nothing drains the queue
        let (actor, handle) = fx.engine(100);
        let mut pending = Vec::new();
        for _ in 0..100 {
            let handle = handle.clone();
            let item = work(&bank, &alice, dec!(1));
            pending.push(tokio::spawn(async move { handle.submit(item).await }));
        }
        wait_until_queued(&handle, 100).await;

        let err = handle.submit(work(&bank, &alice, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert_eq!(fx.metrics.queue_full.get(), 1);

        // Accepted items still complete once the consumer runs
        tokio::spawn(actor.run());
        for task in pending {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fx.storage.transfer_count(), 100);
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "100");
    }

    #[tokio::test]
    async fn test_stalled_persistence_backs_up_queue() {
        let fx = fixture(GatedStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        let (actor, handle) = fx.engine(4);
        tokio::spawn(actor.run());

        // First item is taken by the consumer and blocks in storage
        let first = {
            let handle = handle.clone();
            let item = work(&bank, &alice, dec!(1));
            tokio::spawn(async move { handle.submit(item).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.queued(), 0);

        let mut pending = Vec::new();
        for _ in 0..4 {
            let handle = handle.clone();
            let item = work(&bank, &alice, dec!(1));
            pending.push(tokio::spawn(async move { handle.submit(item).await }));
        }
        wait_until_queued(&handle, 4).await;

        let err = handle.submit(work(&bank, &alice, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        fx.storage.gate.add_permits(5);
        first.await.unwrap().unwrap();
        for task in pending {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fx.storage.inner.transfer_count(), 5);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_isolated() {
        let fx = fixture(FlakyStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        let (actor, handle) = fx.engine(8);
        tokio::spawn(actor.run());

        fx.storage.set_failing(true);
        let err = handle.submit(work(&bank, &alice, dec!(10))).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "0");
        assert_eq!(fx.metrics.transfer_failures.get(), 1);

        // The loop keeps running for later items
        fx.storage.set_failing(false);
        handle.submit(work(&bank, &alice, dec!(10))).await.unwrap();
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "10");
    }

    #[tokio::test]
    async fn test_overflowing_transfer_keeps_engine_alive() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;
        let carol = fx.account("carol").await;
        let dave = fx.account("dave").await;

        let (actor, handle) = fx.engine(8);
        tokio::spawn(actor.run());

        handle.submit(work(&bank, &alice, Decimal::MAX)).await.unwrap();
        let err = handle.submit(work(&bank, &alice, Decimal::MAX)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(fx.metrics.transfer_failures.get(), 1);
        assert_eq!(fx.storage.transfer_count(), 1);
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance, Decimal::MAX);
        assert_eq!(fx.cache.lookup("bank", Ledger::Sups).unwrap().debits_posted, Decimal::MAX);

        handle.submit(work(&carol, &dave, dec!(7))).await.unwrap();
        assert_eq!(fx.cache.lookup("dave", Ledger::Sups).unwrap().balance_string(), "7");
        assert_eq!(fx.storage.transfer_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        let (actor, handle) = fx.engine(8);
        tokio::spawn(actor.run());

        let item = work(&bank, &alice, dec!(10));
        handle.submit(item.clone()).await.unwrap();
        let err = handle.submit(item).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTransfer(_)));
        assert_eq!(fx.cache.lookup("alice", Ledger::Sups).unwrap().balance_string(), "10");
    }

    #[tokio::test]
    async fn test_shutdown_drains_earlier_items() {
        let fx = fixture(MemoryStorage::new());
        let bank = fx.account("bank").await;
        let alice = fx.account("alice").await;

        let (actor, handle) = fx.engine(16);
        let mut pending = Vec::new();
        for _ in 0..5 {
            let handle = handle.clone();
            let item = work(&bank, &alice, dec!(2));
            pending.push(tokio::spawn(async move { handle.submit(item).await }));
        }
        wait_until_queued(&handle, 5).await;

        let task = tokio::spawn(actor.run());
        handle.shutdown().await;
        task.await.unwrap();

        for pending in pending {
            pending.await.unwrap().unwrap();
        }
        assert_eq!(fx.storage.transfer_count(), 5);

        assert!(handle.is_closed());
        let err = handle.submit(work(&bank, &alice, dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::EngineClosed));

        // Second shutdown is a no-op
        handle.shutdown().await;
    }
}
