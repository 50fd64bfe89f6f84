//! Consumer-side deduplication
//!
//! Every consumer group keeps its own set of processed event ids. A delivery
//! first claims the event id with a lease, runs the handler, then finalizes
//! the claim once the side effects are durable. A concurrent delivery of the
//! same event sees the live claim and backs off instead of running the
//! handler a second time. Purging is only safe for records older than the
//! longest time a message can still be redelivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::consumer::ConsumerConfig;
use crate::store::StoreError;

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery owns the event until the lease runs out
    Claimed,
    /// The event was already fully processed
    AlreadyProcessed,
    /// Another delivery holds a live claim
    InProgress,
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Whether `event_id` was already fully processed by `consumer_id`
    async fn already_processed(&self, consumer_id: &str, event_id: Uuid)
        -> Result<bool, StoreError>;

    /// Atomically claim `event_id` for `consumer_id`
    ///
    /// Insert-if-absent. A claim whose lease has expired is taken over, so a
    /// consumer that died mid-handler does not block the event forever.
    async fn claim(
        &self,
        consumer_id: &str,
        event_id: Uuid,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Record `event_id` as processed by `consumer_id`
    ///
    /// Finalizes a claim, or inserts directly when there is none. Returns
    /// `true` when the record is new and `false` when it was already
    /// processed.
    async fn mark_processed(&self, consumer_id: &str, event_id: Uuid) -> Result<bool, StoreError>;

    /// Drop an unfinished claim so the next delivery can retry at once
    ///
    /// Processed records are left alone.
    async fn release(&self, consumer_id: &str, event_id: Uuid) -> Result<(), StoreError>;

    /// Delete records processed before `before`, returning how many went
    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Periodic deletion of old processed records
///
/// A record may only go once no copy of its message can still arrive, so
/// the retention has to outlast the redelivery window of every consumer
/// sharing the store.
pub struct ProcessedPurger {
    guard: Arc<dyn IdempotencyGuard>,
    retention: Duration,
    interval: Duration,
}

impl ProcessedPurger {
    pub fn new(
        guard: Arc<dyn IdempotencyGuard>,
        retention: Duration,
        interval: Duration,
        consumers: &[&ConsumerConfig],
    ) -> Result<Self, String> {
        if interval.is_zero() {
            return Err("processed purge interval must be positive".to_string());
        }
        for consumer in consumers {
            consumer.check_processed_retention(retention)?;
        }
        Ok(Self {
            guard,
            retention,
            interval,
        })
    }

    /// Delete records older than the retention period
    pub async fn purge_once(&self) -> Result<u64, StoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.guard.purge_processed(Utc::now() - retention).await
    }

    /// Purge every `interval` until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting processed-event purger"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick fires at once; skip it so startup does no deletes
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            match self.purge_once().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged = purged, "Purged processed-event records"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge processed-event records"),
            }
        }

        tracing::info!("Processed-event purger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn consumer() -> ConsumerConfig {
        ConsumerConfig {
            visibility_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(30),
            max_deliveries: 3,
            ..ConsumerConfig::new("order-consumer", "order-service")
        }
    }

    fn purger(store: &MemoryStore, retention: Duration) -> Result<ProcessedPurger, String> {
        ProcessedPurger::new(
            Arc::new(store.clone()),
            retention,
            Duration::from_millis(20),
            &[&consumer()],
        )
    }

    #[test]
    fn test_retention_inside_redelivery_window_rejected() {
        let store = MemoryStore::new();

        assert!(purger(&store, Duration::from_millis(300)).is_err());
        assert!(purger(&store, Duration::from_millis(400)).is_ok());
        assert!(ProcessedPurger::new(
            Arc::new(store),
            Duration::from_secs(3600),
            Duration::ZERO,
            &[&consumer()],
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_purge_once_keeps_records_inside_retention() {
        let store = MemoryStore::new();
        let old = Uuid::new_v4();
        store.mark_processed("order-consumer", old).await.unwrap();

        let purger = purger(&store, Duration::from_millis(400)).unwrap();
        assert_eq!(purger.purge_once().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(450)).await;
        let fresh = Uuid::new_v4();
        store.mark_processed("order-consumer", fresh).await.unwrap();

        assert_eq!(purger.purge_once().await.unwrap(), 1);
        assert!(!store.already_processed("order-consumer", old).await.unwrap());
        assert!(store.already_processed("order-consumer", fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_running_purger_clears_expired_records_and_stops() {
        let store = MemoryStore::new();
        store
            .mark_processed("order-consumer", Uuid::new_v4())
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(purger(&store, Duration::from_millis(400)).unwrap().run(rx));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.processed_count("order-consumer"), 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("purger should stop")
            .unwrap();
    }
}
