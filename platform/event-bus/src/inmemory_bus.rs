//! In-memory implementation of the QueueTransport trait for testing and development

use crate::{BusError, BusResult, QueueMessage, QueueTransport, ReceiptHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// A message sitting in a queue, visible or in flight
#[derive(Debug)]
struct Slot {
    body: Vec<u8>,
    delivery_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct Queues {
    by_name: HashMap<String, Vec<Slot>>,
}

/// QueueTransport implementation using in-process queues
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need redelivery and visibility timeouts without a broker
///
/// Semantics follow a managed queue: a received message is hidden until its
/// visibility deadline, reappears with an incremented delivery count if it
/// is not acknowledged, and only `acknowledge` removes it.
///
/// # Example
/// ```rust
/// use event_bus::{InMemoryQueue, QueueTransport};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryQueue::new();
/// queue.send_raw("order-service", b"hello".to_vec()).await?;
///
/// let batch = queue.receive("order-service", 10, Duration::from_secs(30)).await?;
/// assert_eq!(batch[0].delivery_count, 1);
/// queue.acknowledge(&batch[0].receipt).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<Queues>>,
    arrivals: Arc<Notify>,
    available: Arc<AtomicBool>,
    poll_wait: Duration,
    max_message_bytes: usize,
}

impl InMemoryQueue {
    /// Default long-poll wait when a queue is empty
    pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(200);

    /// Same limit as a managed queue service (256 KiB)
    pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

    /// Create a new in-memory queue transport
    pub fn new() -> Self {
        Self::with_poll_wait(Self::DEFAULT_POLL_WAIT)
    }

    /// Create a transport with a custom long-poll wait
    ///
    /// # Arguments
    /// * `poll_wait` - How long `receive` waits for a message before returning an empty batch
    pub fn with_poll_wait(poll_wait: Duration) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            arrivals: Arc::new(Notify::new()),
            available: Arc::new(AtomicBool::new(true)),
            poll_wait,
            max_message_bytes: Self::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Simulate the transport going down (or coming back)
    ///
    /// While unavailable every operation fails with `BusError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages in a queue, in flight or not
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .by_name
            .get(queue)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    /// Number of messages currently in flight (received, not yet acknowledged or expired)
    pub fn in_flight(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .by_name
            .get(queue)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| s.receipt.is_some() && s.visible_at > now)
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        // A poisoned lock only means a panicking test thread; the data is still consistent
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory queue switched off".to_string()))
        }
    }

    /// Take every visible message (up to `max`) and hide it for `visibility_timeout`
    ///
    /// Returns the batch plus the earliest moment a hidden message becomes visible.
    fn take_visible(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut queues = self.lock();
        let slots = queues.by_name.entry(queue.to_string()).or_default();

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for slot in slots.iter_mut() {
            if slot.visible_at <= now {
                if batch.len() >= max {
                    continue;
                }
                let receipt = ReceiptHandle::new(Uuid::new_v4().to_string());
                slot.delivery_count += 1;
                slot.visible_at = now + visibility_timeout;
                slot.receipt = Some(receipt.clone());

                batch.push(QueueMessage {
                    queue: queue.to_string(),
                    body: slot.body.clone(),
                    receipt,
                    delivery_count: slot.delivery_count,
                });
            } else {
                next_visible = Some(match next_visible {
                    Some(t) => t.min(slot.visible_at),
                    None => slot.visible_at,
                });
            }
        }

        (batch, next_visible)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send_raw(&self, queue: &str, body: Vec<u8>) -> BusResult<()> {
        self.ensure_available()?;

        if body.len() > self.max_message_bytes {
            return Err(BusError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_message_bytes,
            });
        }

        self.lock()
            .by_name
            .entry(queue.to_string())
            .or_default()
            .push(Slot {
                body,
                delivery_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });

        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> BusResult<Vec<QueueMessage>> {
        self.ensure_available()?;

        let deadline = Instant::now() + self.poll_wait;

        loop {
            // Registered before the scan so a send landing in between still wakes us
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (batch, next_visible) = self.take_visible(queue, max_messages.max(1), visibility_timeout);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake on a new arrival, an expiring visibility timeout or the poll deadline
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, arrival).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> BusResult<()> {
        self.ensure_available()?;

        let mut queues = self.lock();
        for slots in queues.by_name.values_mut() {
            if let Some(pos) = slots
                .iter()
                .position(|s| s.receipt.as_ref() == Some(receipt))
            {
                slots.remove(pos);
                return Ok(());
            }
        }

        Err(BusError::InvalidReceipt(receipt.to_string()))
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, duration: Duration) -> BusResult<()> {
        self.ensure_available()?;

        let mut queues = self.lock();
        let slot = queues
            .by_name
            .values_mut()
            .flat_map(|slots| slots.iter_mut())
            .find(|s| s.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| BusError::InvalidReceipt(receipt.to_string()))?;

        slot.visible_at = Instant::now() + duration;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::with_poll_wait(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let bus = queue();
        bus.send_raw("order-service", b"one".to_vec()).await.unwrap();

        let batch = bus
            .receive("order-service", 10, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, b"one");
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(batch[0].queue, "order-service");
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let bus = queue();
        bus.send_raw("cart-service", b"user".to_vec()).await.unwrap();

        let batch = bus
            .receive("order-service", 10, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert_eq!(bus.depth("cart-service"), 1);
    }

    #[tokio::test]
    async fn test_in_flight_message_is_hidden() {
        let bus = queue();
        bus.send_raw("q", b"m".to_vec()).await.unwrap();

        let first = bus.receive("q", 10, Duration::from_secs(30)).await.unwrap();
        let second = bus.receive("q", 10, Duration::from_secs(30)).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(bus.in_flight("q"), 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_message_is_redelivered() {
        let bus = queue();
        bus.send_raw("q", b"m".to_vec()).await.unwrap();

        let first = bus.receive("q", 1, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let second = bus.receive("q", 1, Duration::from_millis(10)).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(first[0].receipt, second[0].receipt);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_message() {
        let bus = queue();
        bus.send_raw("q", b"m".to_vec()).await.unwrap();

        let batch = bus.receive("q", 1, Duration::from_millis(10)).await.unwrap();
        bus.acknowledge(&batch[0].receipt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert_eq!(bus.depth("q"), 0);
        assert!(bus.receive("q", 1, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_receipt_rejected() {
        let bus = queue();
        bus.send_raw("q", b"m".to_vec()).await.unwrap();

        let first = bus.receive("q", 1, Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _second = bus.receive("q", 1, Duration::from_secs(30)).await.unwrap();

        let err = bus.acknowledge(&first[0].receipt).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidReceipt(_)));
    }

    #[tokio::test]
    async fn test_extend_visibility_delays_redelivery() {
        let bus = queue();
        bus.send_raw("q", b"m".to_vec()).await.unwrap();

        let batch = bus.receive("q", 1, Duration::from_millis(10)).await.unwrap();
        bus.extend_visibility(&batch[0].receipt, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(bus.receive("q", 1, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_arrival() {
        let bus = InMemoryQueue::with_poll_wait(Duration::from_secs(5));
        let sender = bus.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send_raw("q", b"late".to_vec()).await.unwrap();
        });

        let batch = tokio::time::timeout(
            Duration::from_secs(2),
            bus.receive("q", 1, Duration::from_secs(30)),
        )
        .await
        .expect("receive should wake before the poll deadline")
        .unwrap();

        assert_eq!(batch[0].body, b"late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_racing_the_scan_is_not_missed() {
        let bus = InMemoryQueue::with_poll_wait(Duration::from_secs(10));

        for round in 0..200 {
            let queue = format!("q{round}");
            let receiver = bus.clone();
            let name = queue.clone();
            let pending = tokio::spawn(async move {
                receiver.receive(&name, 1, Duration::from_secs(30)).await
            });

            tokio::task::yield_now().await;
            bus.send_raw(&queue, b"m".to_vec()).await.unwrap();

            let batch = tokio::time::timeout(Duration::from_secs(2), pending)
                .await
                .expect("receive should see the send without waiting for the poll deadline")
                .unwrap()
                .unwrap();
            assert_eq!(batch.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unavailable_transport_fails() {
        let bus = queue();
        bus.set_available(false);

        let err = bus.send_raw("q", b"m".to_vec()).await.unwrap_err();
        assert!(err.is_retryable());

        bus.set_available(true);
        assert!(bus.send_raw("q", b"m".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let bus = queue();
        let body = vec![b'x'; InMemoryQueue::DEFAULT_MAX_MESSAGE_BYTES + 1];

        let err = bus.send_raw("q", body).await.unwrap_err();
        assert!(matches!(err, BusError::PayloadTooLarge { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_batch_size_respected() {
        let bus = queue();
        for i in 0..5 {
            bus.send_raw("q", format!("m{i}").into_bytes()).await.unwrap();
        }

        let batch = bus.receive("q", 3, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].body, b"m0");
    }
}
