//! NATS JetStream implementation of the QueueTransport trait

use crate::{BusError, BusResult, QueueMessage, QueueTransport, ReceiptHandle};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind, Context};
use async_nats::Client;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Stream holding every logical queue (`queues.<name>` subjects)
pub const COMMERCE_STREAM: &str = "COMMERCE_QUEUES";

/// QueueTransport implementation using NATS JetStream
///
/// Each logical queue is a subject `queues.<name>` in one work-queue stream,
/// consumed through a durable pull consumer of the same name with explicit
/// acknowledgement. The consumer's `ack_wait` plays the role of the
/// visibility timeout: it is taken from the first `receive` call for that
/// queue. `extend_visibility` sends an in-progress ack, which resets the
/// server-side `ack_wait` timer.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{JetStreamQueue, QueueTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let queue = JetStreamQueue::connect(nats_client).await?;
/// queue.send_raw("order-service", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
pub struct JetStreamQueue {
    context: Context,
    consumers: DashMap<String, jetstream::consumer::Consumer<pull::Config>>,
    in_flight: InFlight<jetstream::Message>,
    poll_wait: Duration,
}

/// Delivered messages waiting for an ack, keyed by receipt
///
/// Each entry expires with its visibility timeout. Past that point the
/// server has already made the message available again under a new
/// receipt, so an entry nobody acked is dropped instead of kept forever.
struct InFlight<M> {
    entries: DashMap<ReceiptHandle, (M, Instant)>,
}

impl<M: Clone> InFlight<M> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn track(&self, receipt: ReceiptHandle, message: M, visible_again_at: Instant) {
        self.entries.insert(receipt, (message, visible_again_at));
    }

    fn take(&self, receipt: &ReceiptHandle) -> Option<M> {
        self.entries.remove(receipt).map(|(_, (message, _))| message)
    }

    /// Push the expiry of a live entry out to `visible_again_at`
    fn touch(&self, receipt: &ReceiptHandle, visible_again_at: Instant) -> Option<M> {
        let mut entry = self.entries.get_mut(receipt)?;
        entry.1 = visible_again_at;
        Some(entry.0.clone())
    }

    /// Drop entries whose visibility ran out before `now`
    fn evict_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, visible_again_at)| *visible_again_at > now);
        before - self.entries.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl JetStreamQueue {
    /// Connect to JetStream and make sure the queue stream exists
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    pub async fn connect(client: Client) -> BusResult<Self> {
        let context = jetstream::new(client);

        let stream_cfg = jetstream::stream::Config {
            name: COMMERCE_STREAM.to_string(),
            subjects: vec!["queues.>".to_string()],
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            ..Default::default()
        };

        context
            .get_or_create_stream(stream_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(Self {
            context,
            consumers: DashMap::new(),
            in_flight: InFlight::new(),
            poll_wait: Duration::from_secs(5),
        })
    }

    /// Override the long-poll wait used by `receive`
    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    fn subject(queue: &str) -> String {
        format!("queues.{queue}")
    }

    async fn consumer(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> BusResult<jetstream::consumer::Consumer<pull::Config>> {
        if let Some(existing) = self.consumers.get(queue) {
            return Ok(existing.clone());
        }

        let stream = self
            .context
            .get_stream(COMMERCE_STREAM)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                queue,
                pull::Config {
                    durable_name: Some(queue.to_string()),
                    filter_subject: Self::subject(queue),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: visibility_timeout,
                    // Redelivery limits and dead-lettering are decided by the consumer loop
                    max_deliver: -1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::ReceiveError(e.to_string()))?;

        self.consumers.insert(queue.to_string(), consumer.clone());
        Ok(consumer)
    }
}

#[async_trait]
impl QueueTransport for JetStreamQueue {
    async fn send_raw(&self, queue: &str, body: Vec<u8>) -> BusResult<()> {
        let ack = self
            .context
            .publish(Self::subject(queue), body.into())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        // The send only counts once the stream has persisted it
        ack.await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> BusResult<Vec<QueueMessage>> {
        let consumer = self.consumer(queue, visibility_timeout).await?;

        let evicted = self.in_flight.evict_expired(Instant::now());
        if evicted > 0 {
            tracing::debug!(queue = %queue, evicted, "Dropped expired in-flight receipts");
        }

        let mut batch = consumer
            .fetch()
            .max_messages(max_messages.max(1))
            .expires(self.poll_wait)
            .messages()
            .await
            .map_err(|e| BusError::ReceiveError(e.to_string()))?;

        let mut received = Vec::new();
        while let Some(next) = batch.next().await {
            let message = next.map_err(|e| BusError::ReceiveError(e.to_string()))?;

            let delivery_count = message
                .info()
                .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
                .unwrap_or(1);

            let receipt = ReceiptHandle::new(Uuid::new_v4().to_string());
            let visible_again_at = Instant::now() + visibility_timeout;
            received.push(QueueMessage {
                queue: queue.to_string(),
                body: message.message.payload.to_vec(),
                receipt: receipt.clone(),
                delivery_count,
            });
            self.in_flight.track(receipt, message, visible_again_at);
        }

        Ok(received)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> BusResult<()> {
        let message = self
            .in_flight
            .take(receipt)
            .ok_or_else(|| BusError::InvalidReceipt(receipt.to_string()))?;

        message
            .ack()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, duration: Duration) -> BusResult<()> {
        let message = self
            .in_flight
            .touch(receipt, Instant::now() + duration)
            .ok_or_else(|| BusError::InvalidReceipt(receipt.to_string()))?;

        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }
}
