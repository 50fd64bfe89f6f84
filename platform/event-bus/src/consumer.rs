//! Idempotent consumer loop
//!
//! Pulls batches from one queue and drives each message through
//! decode -> claim -> handler -> mark processed -> acknowledge.
//! A message is only acknowledged once its outcome is durable: either its
//! side effects are recorded as processed or it sits in the dead-letter sink.
//! Everything else is left for the transport to redeliver.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::dlq::{self, DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::{BusError, EventEnvelope, EventType, QueueMessage, QueueTransport, ReceiptHandle};

/// Failure reported by an [`EventHandler`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// A dependency is not ready yet; the message will be redelivered
    #[error("retryable handler error: {0}")]
    Retryable(String),

    /// The event can never be applied; the message is dead-lettered
    #[error("fatal handler error: {0}")]
    Fatal(String),
}

/// Applies the side effects of one event
///
/// Handlers must tolerate being run more than once for the same envelope:
/// a crash between the side effects and the processed record causes a
/// redelivery that claims the event again once the lease runs out.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Dispatch table from event type to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn on(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn get(&self, event_type: &EventType) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.handlers.keys()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    Acknowledging,
    Stopped,
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Side effects applied, recorded and acknowledged
    Applied,
    /// Already processed by this consumer, acknowledged without running the handler
    Duplicate,
    /// No handler for this event type, acknowledged
    Skipped,
    /// Parked in the dead-letter sink and acknowledged
    DeadLettered(DeadLetterReason),
    /// Not acknowledged, the transport will redeliver it
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group identity used for deduplication
    pub consumer_id: String,
    pub queue: String,
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    /// Deliveries after which a retryable failure is dead-lettered
    pub max_deliveries: u32,
    /// How often visibility is extended while a handler runs
    pub heartbeat_interval: Duration,
    /// A handler running longer than this is abandoned as retryable
    pub handler_timeout: Duration,
    /// Pause after a failed receive
    pub idle_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(consumer_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            queue: queue.into(),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
            heartbeat_interval: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(240),
            idle_backoff: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.consumer_id.trim().is_empty() {
            return Err("consumer_id must not be empty".to_string());
        }
        if self.queue.trim().is_empty() {
            return Err("queue must not be empty".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if self.max_deliveries == 0 {
            return Err("max_deliveries must be positive".to_string());
        }
        if self.visibility_timeout.is_zero() {
            return Err("visibility_timeout must be positive".to_string());
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.visibility_timeout {
            return Err("heartbeat_interval must be positive and shorter than visibility_timeout".to_string());
        }
        Ok(())
    }

    /// How long a delivery owns an event id while its handler runs
    pub fn claim_lease(&self) -> Duration {
        self.handler_timeout + self.heartbeat_interval
    }

    /// Longest time a message can keep coming back
    pub fn max_redelivery_window(&self) -> Duration {
        self.visibility_timeout * self.max_deliveries
    }

    /// Reject a processed-record retention that a redelivery could outlive
    pub fn check_processed_retention(&self, retention: Duration) -> Result<(), String> {
        let window = self.max_redelivery_window();
        if retention <= window {
            return Err(format!(
                "processed-event retention {:?} must exceed the redelivery window {:?}",
                retention, window
            ));
        }
        Ok(())
    }
}

/// Consumer loop for one queue
pub struct ConsumerLoop {
    config: ConsumerConfig,
    transport: Arc<dyn QueueTransport>,
    handlers: HandlerRegistry,
    guard: Arc<dyn IdempotencyGuard>,
    dead_letters: Arc<dyn DeadLetterSink>,
    state: watch::Sender<ConsumerState>,
}

/// Handle to a spawned consumer loop
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConsumerState>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Stop polling, let the in-flight message finish and wait for the task
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(true);
        self.join.await
    }
}

impl ConsumerLoop {
    pub fn new(
        config: ConsumerConfig,
        transport: Arc<dyn QueueTransport>,
        handlers: HandlerRegistry,
        guard: Arc<dyn IdempotencyGuard>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            config,
            transport,
            handlers,
            guard,
            dead_letters,
            state,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Receive one batch, waiting a bounded time when the queue is empty
    pub async fn poll(&self) -> Result<Vec<QueueMessage>, BusError> {
        self.set_state(ConsumerState::Polling);
        let result = self
            .transport
            .receive(
                &self.config.queue,
                self.config.batch_size,
                self.config.visibility_timeout,
            )
            .await;
        self.set_state(ConsumerState::Idle);
        result
    }

    /// Drive one delivery to its outcome
    pub async fn process(&self, message: &QueueMessage) -> ProcessOutcome {
        self.set_state(ConsumerState::Processing);
        let outcome = self.process_inner(message).await;
        self.set_state(ConsumerState::Idle);
        outcome
    }

    async fn process_inner(&self, message: &QueueMessage) -> ProcessOutcome {
        let consumer_id = self.config.consumer_id.as_str();

        let envelope = match message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    consumer_id = %consumer_id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Malformed message"
                );
                return self
                    .dead_letter_and_ack(message, DeadLetterReason::Malformed, e.to_string())
                    .await;
            }
        };

        let event_id = envelope.id();
        let event_type = envelope.event_type();

        let handler = match self.handlers.get(event_type) {
            Some(handler) => handler.clone(),
            None => {
                tracing::info!(
                    consumer_id = %consumer_id,
                    event_id = %event_id,
                    event_type = %event_type,
                    "No handler for event type, acknowledging"
                );
                self.ack(&message.receipt).await;
                return ProcessOutcome::Skipped;
            }
        };

        match self
            .guard
            .claim(consumer_id, event_id, self.config.claim_lease())
            .await
        {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyProcessed) => {
                tracing::info!(
                    consumer_id = %consumer_id,
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate event detected, skipping"
                );
                self.ack(&message.receipt).await;
                return ProcessOutcome::Duplicate;
            }
            Ok(ClaimOutcome::InProgress) => {
                tracing::info!(
                    consumer_id = %consumer_id,
                    event_id = %event_id,
                    event_type = %event_type,
                    "Event being handled by another delivery, leaving message for redelivery"
                );
                return ProcessOutcome::Deferred;
            }
            Err(e) => {
                tracing::warn!(
                    consumer_id = %consumer_id,
                    event_id = %event_id,
                    error = %e,
                    "Dedup claim failed, leaving message for redelivery"
                );
                return ProcessOutcome::Deferred;
            }
        }

        match self.run_handler(handler, &envelope, &message.receipt).await {
            Ok(()) => {
                self.set_state(ConsumerState::Acknowledging);

                let newly_recorded = match self.guard.mark_processed(consumer_id, event_id).await {
                    Ok(newly_recorded) => newly_recorded,
                    Err(e) => {
                        tracing::warn!(
                            consumer_id = %consumer_id,
                            event_id = %event_id,
                            error = %e,
                            "Failed to record processed event, leaving message for redelivery"
                        );
                        self.release(event_id).await;
                        return ProcessOutcome::Deferred;
                    }
                };

                self.ack(&message.receipt).await;

                if newly_recorded {
                    tracing::info!(
                        consumer_id = %consumer_id,
                        event_id = %event_id,
                        event_type = %event_type,
                        "Event processed"
                    );
                    ProcessOutcome::Applied
                } else {
                    tracing::info!(
                        consumer_id = %consumer_id,
                        event_id = %event_id,
                        "Concurrent delivery recorded the event first"
                    );
                    ProcessOutcome::Duplicate
                }
            }
            Err(HandlerError::Retryable(reason)) => {
                self.release(event_id).await;

                if message.delivery_count >= self.config.max_deliveries {
                    return self
                        .dead_letter_and_ack(message, DeadLetterReason::RetriesExhausted, reason)
                        .await;
                }

                tracing::debug!(
                    consumer_id = %consumer_id,
                    event_id = %event_id,
                    delivery_count = message.delivery_count,
                    max_deliveries = self.config.max_deliveries,
                    reason = %reason,
                    "Retryable failure, message will be redelivered"
                );
                ProcessOutcome::Deferred
            }
            Err(HandlerError::Fatal(reason)) => {
                self.release(event_id).await;
                self.dead_letter_and_ack(message, DeadLetterReason::Fatal, reason)
                    .await
            }
        }
    }

    /// Give up this delivery's claim; on failure the lease expires on its own
    async fn release(&self, event_id: Uuid) {
        if let Err(e) = self.guard.release(&self.config.consumer_id, event_id).await {
            tracing::warn!(
                consumer_id = %self.config.consumer_id,
                event_id = %event_id,
                error = %e,
                "Failed to release event claim"
            );
        }
    }

    /// Run the handler, extending visibility on every heartbeat, bounded by the handler timeout
    async fn run_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        envelope: &EventEnvelope,
        receipt: &ReceiptHandle,
    ) -> Result<(), HandlerError> {
        let work = handler.handle(envelope);
        tokio::pin!(work);

        let deadline = tokio::time::sleep(self.config.handler_timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = &mut deadline => {
                    tracing::warn!(
                        event_id = %envelope.id(),
                        timeout_ms = self.config.handler_timeout.as_millis() as u64,
                        "Handler timed out"
                    );
                    return Err(HandlerError::Retryable(format!(
                        "handler exceeded {:?}",
                        self.config.handler_timeout
                    )));
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .transport
                        .extend_visibility(receipt, self.config.visibility_timeout)
                        .await
                    {
                        tracing::warn!(
                            event_id = %envelope.id(),
                            error = %e,
                            "Failed to extend visibility"
                        );
                    }
                }
            }
        }
    }

    async fn dead_letter_and_ack(
        &self,
        message: &QueueMessage,
        reason: DeadLetterReason,
        error: String,
    ) -> ProcessOutcome {
        let letter = DeadLetter::from_message(&self.config.consumer_id, message, reason, error);

        if dlq::park(self.dead_letters.as_ref(), letter).await.is_err() {
            return ProcessOutcome::Deferred;
        }

        self.set_state(ConsumerState::Acknowledging);
        self.ack(&message.receipt).await;
        ProcessOutcome::DeadLettered(reason)
    }

    async fn ack(&self, receipt: &ReceiptHandle) {
        if let Err(e) = self.transport.acknowledge(receipt).await {
            // The outcome is already durable; a redelivery is absorbed by the dedup check
            tracing::warn!(
                consumer_id = %self.config.consumer_id,
                receipt = %receipt,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }

    /// Poll and process until `shutdown` flips to `true`
    ///
    /// On shutdown the in-flight message is allowed to finish; the rest of
    /// the batch stays unacknowledged and is redelivered later.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            consumer_id = %self.config.consumer_id,
            queue = %self.config.queue,
            handlers = ?self.handlers,
            "Starting consumer loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.poll() => batch,
            };

            match batch {
                Ok(messages) => {
                    for message in messages {
                        if *shutdown.borrow() {
                            tracing::info!(
                                consumer_id = %self.config.consumer_id,
                                "Shutdown requested, leaving rest of batch for redelivery"
                            );
                            break;
                        }

                        let span = tracing::info_span!(
                            "process_event",
                            consumer_id = %self.config.consumer_id,
                            queue = %message.queue,
                            delivery_count = message.delivery_count,
                        );
                        self.process(&message).instrument(span).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        consumer_id = %self.config.consumer_id,
                        queue = %self.config.queue,
                        error = %e,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        tracing::info!(
            consumer_id = %self.config.consumer_id,
            queue = %self.config.queue,
            "Consumer loop stopped"
        );
    }

    /// Run on a background task
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.subscribe_state();
        let join = tokio::spawn(self.run(shutdown_rx));

        ConsumerHandle {
            shutdown,
            state,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryQueue, MemoryStore, SourceService};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "order-service";

    struct Counting {
        calls: AtomicUsize,
        result: Result<(), HandlerError>,
        delay: Duration,
    }

    impl Counting {
        fn new(result: Result<(), HandlerError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Ok(()),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            visibility_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(5),
            max_deliveries: 3,
            ..ConsumerConfig::new("order-consumer", QUEUE)
        }
    }

    fn consumer(
        config: ConsumerConfig,
        queue: &InMemoryQueue,
        store: &MemoryStore,
        handler: Arc<dyn EventHandler>,
    ) -> ConsumerLoop {
        ConsumerLoop::new(
            config,
            Arc::new(queue.clone()),
            HandlerRegistry::new().on(EventType::CartCreated, handler),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
    }

    fn cart_created() -> EventEnvelope {
        EventEnvelope::new(
            EventType::CartCreated,
            SourceService::CartService,
            json!({"cartId": "c1", "userId": "u1", "total": 42.50}),
        )
        .unwrap()
    }

    async fn receive_one(consumer: &ConsumerLoop) -> QueueMessage {
        let mut batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    #[tokio::test]
    async fn test_success_marks_then_acks() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Ok(()));
        let consumer = consumer(config(), &queue, &store, handler.clone());

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(consumer.process(&message).await, ProcessOutcome::Applied);
        assert_eq!(handler.calls(), 1);
        assert_eq!(store.processed_count("order-consumer"), 1);
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_skips_handler() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Ok(()));
        let consumer = consumer(config(), &queue, &store, handler.clone());
        let envelope = cart_created();

        queue.send(QUEUE, &envelope).await.unwrap();
        queue.send(QUEUE, &envelope).await.unwrap();

        let batch = consumer.poll().await.unwrap();
        assert_eq!(consumer.process(&batch[0]).await, ProcessOutcome::Applied);
        assert_eq!(consumer.process(&batch[1]).await, ProcessOutcome::Duplicate);

        assert_eq!(handler.calls(), 1);
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_overlapping_deliveries_run_handler_once() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::slow(Duration::from_millis(50));
        let first = consumer(config(), &queue, &store, handler.clone());
        let second = consumer(config(), &queue, &store, handler.clone());
        let envelope = cart_created();

        queue.send(QUEUE, &envelope).await.unwrap();
        queue.send(QUEUE, &envelope).await.unwrap();
        let batch = first.poll().await.unwrap();
        assert_eq!(batch.len(), 2);

        let (a, b) = tokio::join!(first.process(&batch[0]), second.process(&batch[1]));

        assert_eq!(handler.calls(), 1);
        assert_eq!(a, ProcessOutcome::Applied);
        assert_eq!(b, ProcessOutcome::Deferred);

        // The held-back copy comes back and is recognised as done
        tokio::time::sleep(Duration::from_millis(250)).await;
        let again = receive_one(&second).await;
        assert_eq!(second.process(&again).await, ProcessOutcome::Duplicate);
        assert_eq!(handler.calls(), 1);
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_releases_claim() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Err(HandlerError::Retryable("snapshot missing".into())));
        let consumer = consumer(config(), &queue, &store, handler.clone());
        let envelope = cart_created();

        queue.send(QUEUE, &envelope).await.unwrap();
        let message = receive_one(&consumer).await;
        assert_eq!(consumer.process(&message).await, ProcessOutcome::Deferred);

        assert_eq!(
            store
                .claim("order-consumer", envelope.id(), Duration::from_secs(60))
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_malformed_body_dead_lettered() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let consumer = consumer(config(), &queue, &store, Counting::new(Ok(())));

        queue.send_raw(QUEUE, b"{not json".to_vec()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(
            consumer.process(&message).await,
            ProcessOutcome::DeadLettered(DeadLetterReason::Malformed)
        );
        assert_eq!(store.dead_letters().len(), 1);
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_acked_without_handler() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Ok(()));
        let consumer = consumer(config(), &queue, &store, handler.clone());

        let unknown = json!({
            "id": uuid::Uuid::new_v4(),
            "type": "CART_ABANDONED",
            "source": "CART_SERVICE",
            "occurredAt": "2024-01-01T00:00:00Z",
            "schemaVersion": 1,
            "payload": {"cartId": "c1"}
        });
        queue
            .send_raw(QUEUE, serde_json::to_vec(&unknown).unwrap())
            .await
            .unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(consumer.process(&message).await, ProcessOutcome::Skipped);
        assert_eq!(handler.calls(), 0);
        assert!(store.dead_letters().is_empty());
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_retryable_not_acked_until_limit() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Err(HandlerError::Retryable("snapshot missing".into())));
        let consumer = consumer(config(), &queue, &store, handler.clone());

        queue.send(QUEUE, &cart_created()).await.unwrap();

        let first = receive_one(&consumer).await;
        assert_eq!(consumer.process(&first).await, ProcessOutcome::Deferred);
        assert_eq!(queue.in_flight(QUEUE), 1);

        let mut message = first;
        message.delivery_count = 3;
        assert_eq!(
            consumer.process(&message).await,
            ProcessOutcome::DeadLettered(DeadLetterReason::RetriesExhausted)
        );

        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].delivery_count, 3);
        assert_eq!(store.processed_count("order-consumer"), 0);
    }

    #[tokio::test]
    async fn test_fatal_dead_lettered_immediately() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let consumer = consumer(
            config(),
            &queue,
            &store,
            Counting::new(Err(HandlerError::Fatal("unknown user".into()))),
        );

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(
            consumer.process(&message).await,
            ProcessOutcome::DeadLettered(DeadLetterReason::Fatal)
        );
        assert_eq!(queue.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_write_keeps_message() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        store.set_dead_letters_available(false);
        let consumer = consumer(
            config(),
            &queue,
            &store,
            Counting::new(Err(HandlerError::Fatal("bad".into()))),
        );

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(consumer.process(&message).await, ProcessOutcome::Deferred);
        assert_eq!(queue.in_flight(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_failed_mark_processed_keeps_message() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        store.set_processed_available(false);
        let consumer = consumer(config(), &queue, &store, Counting::new(Ok(())));

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(consumer.process(&message).await, ProcessOutcome::Deferred);
        assert_eq!(queue.in_flight(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_slow_handler_message_hidden() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let consumer = Arc::new(consumer(
            config(),
            &queue,
            &store,
            Counting::slow(Duration::from_millis(600)),
        ));

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        let worker = consumer.clone();
        let task = tokio::spawn(async move { worker.process(&message).await });

        // Well past the 200ms visibility timeout
        tokio::time::sleep(Duration::from_millis(400)).await;
        let peek = queue
            .receive(QUEUE, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(peek.is_empty());

        assert_eq!(task.await.unwrap(), ProcessOutcome::Applied);
    }

    #[tokio::test]
    async fn test_handler_timeout_is_retryable() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let consumer = consumer(
            ConsumerConfig {
                handler_timeout: Duration::from_millis(50),
                ..config()
            },
            &queue,
            &store,
            Counting::slow(Duration::from_secs(10)),
        );

        queue.send(QUEUE, &cart_created()).await.unwrap();
        let message = receive_one(&consumer).await;

        assert_eq!(consumer.process(&message).await, ProcessOutcome::Deferred);
        assert_eq!(store.processed_count("order-consumer"), 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_processes_and_stops() {
        let queue = InMemoryQueue::with_poll_wait(Duration::from_millis(20));
        let store = MemoryStore::new();
        let handler = Counting::new(Ok(()));
        let handle = consumer(config(), &queue, &store, handler.clone()).spawn();

        queue.send(QUEUE, &cart_created()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.calls(), 1);

        let mut state = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("consumer should stop")
            .unwrap();
        assert_eq!(*state.borrow_and_update(), ConsumerState::Stopped);
    }

    #[test]
    fn test_config_validation() {
        assert!(ConsumerConfig::new("c", "q").validate().is_ok());
        assert!(ConsumerConfig {
            max_deliveries: 0,
            ..ConsumerConfig::new("c", "q")
        }
        .validate()
        .is_err());
        assert!(ConsumerConfig {
            heartbeat_interval: Duration::from_secs(600),
            ..ConsumerConfig::new("c", "q")
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_processed_retention_must_exceed_redelivery_window() {
        let config = ConsumerConfig::new("c", "q");

        assert!(config
            .check_processed_retention(Duration::from_secs(300 * 5))
            .is_err());
        assert!(config
            .check_processed_retention(Duration::from_secs(60 * 60 * 24))
            .is_ok());
    }
}
