//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the transactor.
//!
//! # Metrics
//!
//! - `transactor_transfers_total` - Transfers recorded
//! - `transactor_transfer_failures_total` - Transfers rejected by storage
//! - `transactor_queue_full_total` - Submissions shed because the queue was full
//! - `transactor_transfer_duration_seconds` - Histogram of engine execution time
//! - `transactor_events_dropped_total` - Broadcast events dropped on overflow
//! - `transactor_subscribers` - Live transfer subscribers
//! - `transactor_cache_hydrations_total` - Cache misses that went to storage
//! - `transactor_cached_accounts` - Accounts resident in the balance cache

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry, so several instances can live in one
/// process (tests, embedded use).
#[derive(Clone)]
pub struct Metrics {
    /// Transfers recorded
    pub transfers_total: IntCounter,

    /// Transfers rejected by storage
    pub transfer_failures: IntCounter,

    /// Submissions rejected with `QueueFull`
    pub queue_full: IntCounter,

    /// Engine execution time per transfer
    pub transfer_duration: Histogram,

    /// Broadcast events dropped on producer overflow
    pub events_dropped: IntCounter,

    /// Live subscribers
    pub subscribers: IntGauge,

    /// Cache hydrations
    pub cache_hydrations: IntCounter,

    /// Resident cache entries
    pub cached_accounts: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_total =
            IntCounter::new("transactor_transfers_total", "Transfers recorded")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transfer_failures = IntCounter::new(
            "transactor_transfer_failures_total",
            "Transfers rejected by storage",
        )?;
        registry.register(Box::new(transfer_failures.clone()))?;

        let queue_full = IntCounter::new(
            "transactor_queue_full_total",
            "Submissions shed because the engine queue was full",
        )?;
        registry.register(Box::new(queue_full.clone()))?;

        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new(
                "transactor_transfer_duration_seconds",
                "Histogram of engine execution time per transfer",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(transfer_duration.clone()))?;

        let events_dropped = IntCounter::new(
            "transactor_events_dropped_total",
            "Broadcast events dropped because the event channel was full",
        )?;
        registry.register(Box::new(events_dropped.clone()))?;

        let subscribers = IntGauge::new("transactor_subscribers", "Live transfer subscribers")?;
        registry.register(Box::new(subscribers.clone()))?;

        let cache_hydrations = IntCounter::new(
            "transactor_cache_hydrations_total",
            "Cache misses that loaded a user's accounts from storage",
        )?;
        registry.register(Box::new(cache_hydrations.clone()))?;

        let cached_accounts = IntGauge::new(
            "transactor_cached_accounts",
            "Accounts resident in the balance cache",
        )?;
        registry.register(Box::new(cached_accounts.clone()))?;

        Ok(Self {
            transfers_total,
            transfer_failures,
            queue_full,
            transfer_duration,
            events_dropped,
            subscribers,
            cache_hydrations,
            cached_accounts,
            registry,
        })
    }

    /// Record a recorded transfer and how long the engine spent on it
    pub fn record_transfer(&self, duration_seconds: f64) {
        self.transfers_total.inc();
        self.transfer_duration.observe(duration_seconds);
    }

    /// Record a transfer rejected by storage
    pub fn record_transfer_failure(&self) {
        self.transfer_failures.inc();
    }

    /// Record a submission shed with `QueueFull`
    pub fn record_queue_full(&self) {
        self.queue_full.inc();
    }

    /// Record a broadcast event dropped on overflow
    pub fn record_event_dropped(&self) {
        self.events_dropped.inc();
    }

    /// Update the live subscriber gauge
    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as i64);
    }

    /// Record a cache hydration
    pub fn record_cache_hydration(&self) {
        self.cache_hydrations.inc();
    }

    /// Update the resident account gauge
    pub fn set_cached_accounts(&self, count: usize) {
        self.cached_accounts.set(count as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("transfers_total", &self.transfers_total.get())
            .field("subscribers", &self.subscribers.get())
            .finish()
    }
}
