//! Transactional outbox
//!
//! Business operations never publish directly. They stage their entity
//! writes and the event envelope into one atomic commit, and a background
//! sweep hands pending envelopes to the [`Publisher`]. A crash between the
//! commit and the publish leaves a `PENDING` record that the next sweep
//! picks up, so an event can be published late or twice but never lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::store::StoreError;
use crate::{EventEnvelope, MalformedEventError, Publisher};

/// One entity write: replace the document matching `filter` in `collection`,
/// inserting it when nothing matches
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub collection: String,
    pub filter: Value,
    pub document: Value,
}

/// Entity writes collected by a business operation before commit
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    writes: Vec<DocumentWrite>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, collection: impl Into<String>, filter: Value, document: Value) {
        self.writes.push(DocumentWrite {
            collection: collection.into(),
            filter,
            document,
        });
    }

    pub fn writes(&self) -> &[DocumentWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<DocumentWrite> {
        self.writes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
        }
    }
}

/// A staged envelope awaiting (or done with) publication
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// A sweep holds this record until then
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn pending(envelope: EventEnvelope) -> Self {
        Self {
            event_id: envelope.id(),
            envelope,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            last_error: None,
            claimed_until: None,
        }
    }
}

/// Storage behind the outbox
///
/// `commit` must apply every write of the mutation and insert the record in
/// one atomic unit: either all of it becomes visible or none of it does.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Apply the mutation and insert the record if its event id is absent
    ///
    /// Returns `false` when a record with the same event id already existed.
    async fn commit(&self, mutation: Mutation, record: OutboxRecord) -> Result<bool, StoreError>;

    /// Lease up to `limit` pending records created before `created_before`
    ///
    /// Records leased by another sweep whose lease has not lapsed are skipped.
    async fn claim_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Conditional `PENDING -> PUBLISHED` transition
    ///
    /// Returns `false` when the record was already published.
    async fn mark_published(&self, event_id: Uuid) -> Result<bool, StoreError>;

    /// Count a failed publish and release the lease. The record stays pending.
    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Delete published records older than `before`
    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn find_record(&self, event_id: Uuid) -> Result<Option<OutboxRecord>, StoreError>;
}

/// Errors from [`OutboxCoordinator::stage`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("cannot stage malformed event: {0}")]
    Malformed(#[from] MalformedEventError),

    #[error("outbox commit failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of a successful stage
#[derive(Debug, Clone)]
pub struct Staged<T> {
    pub value: T,
    pub envelope: EventEnvelope,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Time between two sweeps
    pub sweep_interval: Duration,
    /// Records younger than this are left alone
    pub grace_period: Duration,
    /// Maximum records claimed per sweep
    pub batch_size: usize,
    /// How long a claimed record is reserved for the claiming sweep
    pub lease: Duration,
    /// How long published records are kept before purge
    pub retention: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            grace_period: Duration::from_millis(500),
            batch_size: 100,
            lease: Duration::from_secs(30),
            retention: Duration::from_secs(60 * 60 * 24 * 7), // 7 days
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if self.lease.is_zero() {
            return Err("lease must be positive".to_string());
        }
        Ok(())
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Records whose outcome could not be written back; their lease lapses
    /// and a later sweep handles them again
    pub unrecorded: usize,
}

/// Stages events with their business writes and sweeps them to the publisher
pub struct OutboxCoordinator {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<Publisher>,
    config: OutboxConfig,
}

impl OutboxCoordinator {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<Publisher>, config: OutboxConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Stage a business mutation together with the event describing it
    ///
    /// `mutate` records the entity writes and returns the operation's result.
    /// `envelope_factory` builds the envelope from that result. Nothing is
    /// written unless both succeed, and then the writes and a `PENDING`
    /// outbox record are committed atomically. The transport is never
    /// touched here.
    pub async fn stage<T, E, M, F>(&self, mutate: M, envelope_factory: F) -> Result<Staged<T>, E>
    where
        M: FnOnce(&mut Mutation) -> Result<T, E>,
        F: FnOnce(&T) -> Result<EventEnvelope, MalformedEventError>,
        E: From<StageError>,
    {
        let mut mutation = Mutation::new();
        let value = mutate(&mut mutation)?;

        let envelope = envelope_factory(&value).map_err(|e| E::from(StageError::from(e)))?;

        let inserted = self
            .store
            .commit(mutation, OutboxRecord::pending(envelope.clone()))
            .await
            .map_err(|e| E::from(StageError::from(e)))?;

        if inserted {
            tracing::debug!(
                event_id = %envelope.id(),
                event_type = %envelope.event_type(),
                "Event staged to outbox"
            );
        } else {
            tracing::debug!(
                event_id = %envelope.id(),
                event_type = %envelope.event_type(),
                "Event already staged, outbox unchanged"
            );
        }

        Ok(Staged { value, envelope })
    }

    /// Publish every claimable pending record once
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let records = self
            .store
            .claim_pending(Utc::now() - grace, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = SweepReport {
            claimed: records.len(),
            ..SweepReport::default()
        };

        for record in records {
            match self.publisher.publish(&record.envelope).await {
                Ok(ack) => {
                    report.published += 1;

                    match self.store.mark_published(record.event_id).await {
                        Ok(transitioned) => {
                            tracing::info!(
                                event_id = %record.event_id,
                                event_type = %record.envelope.event_type(),
                                queues = ?ack.queues,
                                transitioned = transitioned,
                                "Event published from outbox"
                            );
                        }
                        Err(e) => {
                            // Consumers absorb the republish once the lease lapses
                            report.unrecorded += 1;
                            tracing::warn!(
                                event_id = %record.event_id,
                                event_type = %record.envelope.event_type(),
                                error = %e,
                                "Event published but not marked, it will be published again"
                            );
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;

                    if let Err(store_err) = self
                        .store
                        .record_failure(record.event_id, &e.to_string())
                        .await
                    {
                        report.unrecorded += 1;
                        tracing::warn!(
                            event_id = %record.event_id,
                            publish_error = %e,
                            error = %store_err,
                            "Failed to record publish failure"
                        );
                        continue;
                    }

                    tracing::warn!(
                        event_id = %record.event_id,
                        event_type = %record.envelope.event_type(),
                        attempts = record.attempts + 1,
                        error = %e,
                        "Failed to publish outbox event, will retry"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Periodic sweep until `shutdown` flips to `true`
    ///
    /// Published records past the retention period are purged once per
    /// hundred ticks.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            "Starting outbox sweeper"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        let mut tick_count: u64 = 0;

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

            tick_count += 1;

            match self.sweep_once().await {
                Ok(report) if report.claimed > 0 => {
                    tracing::info!(
                        tick = tick_count,
                        published = report.published,
                        failed = report.failed,
                        unrecorded = report.unrecorded,
                        "Outbox sweep finished"
                    );
                }
                Ok(_) => {
                    if tick_count <= 3 || tick_count % 60 == 0 {
                        tracing::debug!(tick = tick_count, "Outbox sweep: nothing pending");
                    }
                }
                Err(e) => {
                    tracing::error!(tick = tick_count, error = %e, "Outbox sweep failed");
                }
            }

            if tick_count % 100 == 0 {
                self.purge_expired().await;
            }
        }

        tracing::info!("Outbox sweeper stopped");
    }

    async fn purge_expired(&self) {
        let retention = match chrono::Duration::from_std(self.config.retention) {
            Ok(retention) => retention,
            Err(_) => return,
        };

        match self.store.purge_published(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged = purged, "Purged published outbox records"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge published outbox records"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EntityStore, EventType, InMemoryQueue, MemoryStore, QueueRoutes, QueueTransport,
        SourceService,
    };
    use crate::retry::RetryConfig;
    use serde_json::json;

    fn immediate() -> OutboxConfig {
        OutboxConfig {
            grace_period: Duration::ZERO,
            ..OutboxConfig::default()
        }
    }

    fn coordinator(store: &MemoryStore, queue: &InMemoryQueue) -> OutboxCoordinator {
        let publisher = Publisher::new(Arc::new(queue.clone()), QueueRoutes::commerce()).with_retry(
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
        );
        OutboxCoordinator::new(Arc::new(store.clone()), Arc::new(publisher), immediate())
    }

    fn stage_cart(
        mutation: &mut Mutation,
    ) -> Result<String, StageError> {
        mutation.upsert(
            "carts",
            json!({"cartId": "c1"}),
            json!({"cartId": "c1", "userId": "u1", "total": 42.5}),
        );
        Ok("c1".to_string())
    }

    fn cart_envelope(cart_id: &String) -> Result<EventEnvelope, MalformedEventError> {
        EventEnvelope::new(
            EventType::CartCreated,
            SourceService::CartService,
            json!({"cartId": cart_id, "userId": "u1", "total": 42.5}),
        )
    }

    #[tokio::test]
    async fn test_stage_commits_entity_and_pending_record() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = coordinator(&store, &queue);

        let staged = outbox.stage(stage_cart, cart_envelope).await.unwrap();

        let cart = store.find_one("carts", &json!({"cartId": "c1"})).await.unwrap();
        assert_eq!(cart.unwrap()["total"], 42.5);

        let record = store.find_record(staged.envelope.id()).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(queue.depth("order-service"), 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_writes_nothing() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = coordinator(&store, &queue);

        let result: Result<Staged<String>, StageError> = outbox
            .stage(stage_cart, |_| {
                EventEnvelope::new(
                    EventType::CartCreated,
                    SourceService::CartService,
                    json!({"cartId": "c1"}),
                )
            })
            .await;

        assert!(matches!(result, Err(StageError::Malformed(_))));
        let cart = store.find_one("carts", &json!({"cartId": "c1"})).await.unwrap();
        assert!(cart.is_none());
    }

    #[tokio::test]
    async fn test_sweep_publishes_and_marks() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = coordinator(&store, &queue);

        let staged = outbox.stage(stage_cart, cart_envelope).await.unwrap();
        let report = outbox.sweep_once().await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(queue.depth("order-service"), 1);

        let record = store.find_record(staged.envelope.id()).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Published);
        assert!(record.published_at.is_some());

        let again = outbox.sweep_once().await.unwrap();
        assert_eq!(again.claimed, 0);
        assert_eq!(queue.depth("order-service"), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_stays_pending() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = coordinator(&store, &queue);

        let staged = outbox.stage(stage_cart, cart_envelope).await.unwrap();

        queue.set_available(false);
        let report = outbox.sweep_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let record = store.find_record(staged.envelope.id()).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.is_some());

        queue.set_available(true);
        let report = outbox.sweep_once().await.unwrap();
        assert_eq!(report.published, 1);

        let batch = queue
            .receive("order-service", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(batch[0].envelope().unwrap().id(), staged.envelope.id());
    }

    /// Outbox store whose `mark_published` fails for one event id
    struct StuckRecord {
        inner: MemoryStore,
        stuck: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl OutboxStore for StuckRecord {
        async fn commit(&self, mutation: Mutation, record: OutboxRecord) -> Result<bool, StoreError> {
            self.inner.commit(mutation, record).await
        }

        async fn claim_pending(
            &self,
            created_before: DateTime<Utc>,
            limit: usize,
            lease: Duration,
        ) -> Result<Vec<OutboxRecord>, StoreError> {
            self.inner.claim_pending(created_before, limit, lease).await
        }

        async fn mark_published(&self, event_id: Uuid) -> Result<bool, StoreError> {
            if *self.stuck.lock().unwrap() == Some(event_id) {
                return Err(StoreError::Unavailable("outbox row locked".to_string()));
            }
            self.inner.mark_published(event_id).await
        }

        async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<(), StoreError> {
            self.inner.record_failure(event_id, error).await
        }

        async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_published(before).await
        }

        async fn find_record(&self, event_id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
            self.inner.find_record(event_id).await
        }
    }

    #[tokio::test]
    async fn test_sweep_continues_past_bookkeeping_failure() {
        let memory = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let store = Arc::new(StuckRecord {
            inner: memory.clone(),
            stuck: std::sync::Mutex::new(None),
        });
        let outbox = OutboxCoordinator::new(
            store.clone(),
            Arc::new(Publisher::new(Arc::new(queue.clone()), QueueRoutes::commerce())),
            immediate(),
        );

        let first = outbox.stage(stage_cart, cart_envelope).await.unwrap();
        let second = outbox.stage(stage_cart, cart_envelope).await.unwrap();
        *store.stuck.lock().unwrap() = Some(first.envelope.id());

        let report = outbox.sweep_once().await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.published, 2);
        assert_eq!(report.unrecorded, 1);
        assert_eq!(queue.depth("order-service"), 2);

        let stuck = memory.find_record(first.envelope.id()).await.unwrap().unwrap();
        assert_eq!(stuck.status, OutboxStatus::Pending);
        let marked = memory.find_record(second.envelope.id()).await.unwrap().unwrap();
        assert_eq!(marked.status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn test_grace_period_defers_young_records() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let publisher = Publisher::new(Arc::new(queue.clone()), QueueRoutes::commerce());
        let outbox = OutboxCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(publisher),
            OutboxConfig {
                grace_period: Duration::from_secs(3600),
                ..OutboxConfig::default()
            },
        );

        outbox.stage(stage_cart, cart_envelope).await.unwrap();
        let report = outbox.sweep_once().await.unwrap();

        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_restaging_same_event_id_is_noop() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = coordinator(&store, &queue);
        let envelope = cart_envelope(&"c1".to_string()).unwrap();

        let first = envelope.clone();
        outbox
            .stage(stage_cart, move |_| Ok::<_, MalformedEventError>(first))
            .await
            .unwrap();
        outbox.sweep_once().await.unwrap();

        let second = envelope.clone();
        outbox
            .stage(stage_cart, move |_| Ok::<_, MalformedEventError>(second))
            .await
            .unwrap();
        let report = outbox.sweep_once().await.unwrap();

        assert_eq!(report.claimed, 0);
        assert_eq!(queue.depth("order-service"), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        let outbox = Arc::new(OutboxCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(Publisher::new(Arc::new(queue.clone()), QueueRoutes::commerce())),
            OutboxConfig {
                sweep_interval: Duration::from_millis(10),
                grace_period: Duration::ZERO,
                ..OutboxConfig::default()
            },
        ));

        outbox.stage(stage_cart, cart_envelope).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(outbox.clone().run_sweeper(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.depth("order-service"), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(OutboxConfig::default().validate().is_ok());
        assert!(OutboxConfig {
            batch_size: 0,
            ..OutboxConfig::default()
        }
        .validate()
        .is_err());
    }
}
