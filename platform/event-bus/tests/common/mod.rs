#![allow(dead_code)]

use async_trait::async_trait;
use event_bus::retry::RetryConfig;
use event_bus::{
    ConsumerConfig, ConsumerLoop, EntityStore, EventEnvelope, EventHandler, EventType,
    HandlerError, HandlerRegistry, InMemoryQueue, MemoryStore, OutboxConfig, OutboxCoordinator,
    Publisher, QueueRoutes,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ORDER_QUEUE: &str = "order-service";
pub const ORDER_CONSUMER: &str = "order-consumer";

/// Queue with short long-poll so tests do not idle
pub fn fast_queue() -> InMemoryQueue {
    InMemoryQueue::with_poll_wait(Duration::from_millis(20))
}

pub fn outbox(store: &MemoryStore, queue: &InMemoryQueue) -> OutboxCoordinator {
    let publisher = Publisher::new(Arc::new(queue.clone()), QueueRoutes::commerce()).with_retry(
        RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
    );

    OutboxCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(publisher),
        OutboxConfig {
            sweep_interval: Duration::from_millis(20),
            grace_period: Duration::ZERO,
            ..OutboxConfig::default()
        },
    )
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        visibility_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(30),
        handler_timeout: Duration::from_secs(2),
        max_deliveries: 3,
        idle_backoff: Duration::from_millis(20),
        ..ConsumerConfig::new(ORDER_CONSUMER, ORDER_QUEUE)
    }
}

pub fn order_consumer(
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

/// Order-side projection of CART_CREATED into `cart_snapshots`
///
/// Counts every invocation so tests can tell applied side effects from
/// skipped duplicates. While `ready` is false it reports a retryable failure.
pub struct SnapshotHandler {
    store: MemoryStore,
    pub calls: AtomicUsize,
    ready: AtomicBool,
    fatal: bool,
}

impl SnapshotHandler {
    pub fn new(store: &MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            fatal: false,
        })
    }

    pub fn not_ready(store: &MemoryStore) -> Arc<Self> {
        let handler = Self::new(store);
        handler.ready.store(false, Ordering::SeqCst);
        handler
    }

    pub fn always_fatal(store: &MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            fatal: true,
        })
    }

    pub fn make_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for SnapshotHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fatal {
            return Err(HandlerError::Fatal("cart can never be applied".to_string()));
        }
        if !self.ready.load(Ordering::SeqCst) {
            return Err(HandlerError::Retryable("dependency not visible yet".to_string()));
        }

        let payload = envelope.payload();
        let cart_id = payload["cartId"].clone();
        self.store
            .upsert(
                "cart_snapshots",
                &serde_json::json!({ "cartId": cart_id }),
                serde_json::json!({
                    "cartId": cart_id,
                    "userId": payload["userId"],
                    "total": payload["total"],
                }),
            )
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))
    }
}

/// Poll until `check` holds or the deadline passes
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
