//! Publish/subscribe fan-out of completed transfers
//!
//! # Architecture
//!
//! ```text
//!   LedgerEngine ──publish()──► event channel (bounded) ──► dispatch loop
//!                                                              │
//!                                   snapshot of registry ◄─────┘
//!                                              │
//!                        ┌─────────────────────┼─────────────────────┐
//!                        ▼                     ▼                     ▼
//!                   subscriber A          subscriber B          subscriber C
//! ```
//!
//! # Delivery
//!
//! - At-most-once, best effort. No retry, no replay.
//! - A subscriber whose sink is closed or whose buffer is full is removed
//!   after that single failed attempt.
//! - If the event channel itself is full, `publish` drops the new event and
//!   counts it. The engine never waits on subscribers.

use crate::config::BroadcastConfig;
use crate::metrics::Metrics;
use crate::types::TransferEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    sink: mpsc::Sender<TransferEvent>,
    /// Distinguishes a re-registered id from the entry it replaced
    generation: u64,
}

/// Live subscribers keyed by id, guarded by their own lock
struct Registry {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    generations: AtomicU64,
    metrics: Metrics,
}

impl Registry {
    fn insert(&self, id: &str, sink: mpsc::Sender<TransferEvent>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        if subscribers
            .insert(id.to_string(), Subscriber { sink, generation })
            .is_some()
        {
            tracing::debug!(subscriber_id = id, "Replaced existing subscriber");
        }
        self.metrics.set_subscribers(subscribers.len());
        generation
    }

    /// Remove `id` only if it still holds `generation`
    fn remove(&self, id: &str, generation: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let matches = subscribers
            .get(id)
            .map_or(false, |entry| entry.generation == generation);
        if matches {
            subscribers.remove(id);
            self.metrics.set_subscribers(subscribers.len());
        }
        matches
    }

    fn fan_out(&self, event: &TransferEvent) {
        // Snapshot so sends happen without the lock held
        let snapshot: Vec<(String, u64, mpsc::Sender<TransferEvent>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.generation, entry.sink.clone()))
            .collect();

        for (id, generation, sink) in snapshot {
            if let Err(e) = sink.try_send(event.clone()) {
                let reason = match e {
                    TrySendError::Full(_) => "subscriber buffer full",
                    TrySendError::Closed(_) => "subscriber disconnected",
                };
                tracing::warn!(subscriber_id = %id, reason, "Failed to deliver transfer event");
                self.remove(&id, generation);
            }
        }
    }
}

/// Handle to the broadcast hub
#[derive(Clone)]
pub struct BroadcastHub {
    events: mpsc::Sender<TransferEvent>,
    registry: Arc<Registry>,
    subscriber_buffer: usize,
    shutdown: CancellationToken,
}

impl BroadcastHub {
    /// Queue an event for fan-out without waiting
    ///
    /// Returns `false` if the event was dropped.
    pub fn publish(&self, event: TransferEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    transfer_id = %event.transfer.id,
                    account_id = %event.account.id,
                    "Broadcast channel full, dropping transfer event"
                );
                self.registry.metrics.record_event_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Broadcast hub stopped, dropping transfer event");
                false
            }
        }
    }

    /// Register `sink` under `id`, replacing any previous sink with that id
    ///
    /// Returns a token for [`BroadcastHub::deregister`].
    pub fn register(&self, id: &str, sink: mpsc::Sender<TransferEvent>) -> u64 {
        tracing::info!(subscriber_id = id, "New transfer complete subscriber");
        self.registry.insert(id, sink)
    }

    /// Remove the registration identified by `(id, generation)`
    pub fn deregister(&self, id: &str, generation: u64) -> bool {
        let removed = self.registry.remove(id, generation);
        if removed {
            tracing::debug!(subscriber_id = id, "Removing subscriber");
        }
        removed
    }

    // Holds a registration until `cancel` fires, the hub shuts down or the
    // receiving side goes away.
    async fn watch(
        self,
        id: String,
        generation: u64,
        sink: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
            _ = sink.closed() => {}
        }
        self.deregister(&id, generation);
    }

    /// Subscribe and receive events as a stream
    ///
    /// The subscription lives until `cancel` fires or the stream is dropped.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        cancel: CancellationToken,
    ) -> ReceiverStream<TransferEvent> {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = id.into();
        let generation = self.register(&id, tx.clone());

        tokio::spawn(self.clone().watch(id, generation, tx, cancel));

        ReceiverStream::new(rx)
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }

    /// Stop dispatching and end every subscription
    ///
    /// Events already queued are still delivered before the loop exits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Spawn the dispatch loop
pub fn spawn_broadcast_hub(
    config: &BroadcastConfig,
    metrics: Metrics,
) -> (BroadcastHub, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.event_capacity);
    let registry = Arc::new(Registry {
        subscribers: Mutex::new(HashMap::new()),
        generations: AtomicU64::new(0),
        metrics,
    });
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(dispatch(registry.clone(), rx, shutdown.clone()));

    let hub = BroadcastHub {
        events: tx,
        registry,
        subscriber_buffer: config.subscriber_buffer,
        shutdown,
    };
    (hub, task)
}

async fn dispatch(
    registry: Arc<Registry>,
    mut events: mpsc::Receiver<TransferEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                Some(event) => registry.fan_out(&event),
                None => break,
            },

            _ = shutdown.cancelled() => {
                // Deliver what is already buffered, then stop
                events.close();
                while let Some(event) = events.recv().await {
                    registry.fan_out(&event);
                }
                break;
            }
        }
    }

    registry.subscribers.lock().clear();
    registry.metrics.set_subscribers(0);
    tracing::info!("Broadcast dispatcher stopped");
}
