// Batch consumer for the schedule change notification stream

use crate::errors::QueueError;
use crate::notification::RawNotification;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{AckKind, Message};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, instrument, warn};

/// Batch consumer trait
#[async_trait::async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Start consuming batches. Returns when shutdown is requested
    async fn start(&self) -> Result<(), QueueError>;

    /// Request graceful shutdown
    fn shutdown(&self);
}

/// Callback processing one delivered batch.
///
/// `Ok` acknowledges every message of the batch; `Err` negatively
/// acknowledges them so the whole batch is redelivered.
pub type BatchHandler = Arc<
    dyn Fn(Vec<RawNotification>) -> futures::future::BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// Where delivered batches come from and how each delivery is settled
#[async_trait::async_trait]
pub trait BatchSource: Send + Sync + 'static {
    type Delivery: Send + 'static;

    /// Pull the next batch; empty when the fetch window closed idle
    async fn fetch(&self) -> Result<Vec<Self::Delivery>, QueueError>;

    fn to_raw(&self, delivery: &Self::Delivery) -> RawNotification;

    async fn ack(&self, delivery: Self::Delivery) -> Result<(), QueueError>;

    async fn nak(&self, delivery: Self::Delivery) -> Result<(), QueueError>;
}

/// Runs the handler over fetched batches with a bounded number of batches
/// in flight, settling each batch as a whole
pub struct BatchDispatcher<S: BatchSource> {
    source: Arc<S>,
    handler: BatchHandler,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl<S: BatchSource> BatchDispatcher<S> {
    pub fn new(source: S, handler: BatchHandler, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            source: Arc::new(source),
            handler,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }
}

async fn settle<S: BatchSource>(source: &S, deliveries: Vec<S::Delivery>, success: bool) {
    for delivery in deliveries {
        let result = if success {
            source.ack(delivery).await
        } else {
            source.nak(delivery).await
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to settle message");
        }
    }
}

#[async_trait::async_trait]
impl<S: BatchSource> BatchConsumer for BatchDispatcher<S> {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), QueueError> {
        info!(
            max_in_flight = self.max_in_flight,
            "Consumer started, waiting for notifications"
        );

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping consumer");
                break;
            }

            // Hold a slot before pulling so no more than max_in_flight
            // batches are ever outstanding
            let permit = tokio::select! {
                permit = self.in_flight.clone().acquire_owned() => permit
                    .map_err(|e| QueueError::ConsumeFailed(format!("Semaphore closed: {}", e)))?,
                _ = self.shutdown_notify.notified() => break,
            };

            let deliveries = tokio::select! {
                fetched = self.source.fetch() => match fetched {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        error!(error = %e, "Failed to fetch batch");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => break,
            };

            if deliveries.is_empty() {
                continue;
            }

            let source = self.source.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let raw: Vec<RawNotification> =
                    deliveries.iter().map(|d| source.to_raw(d)).collect();
                info!(batch_size = raw.len(), "Processing notification batch");

                let outcome = handler(raw).await;
                if let Err(e) = &outcome {
                    error!(error = %e, "Batch processing failed, requesting redelivery");
                }
                settle(source.as_ref(), deliveries, outcome.is_ok()).await;
            });
        }

        // Wait for in-flight batches to finish
        let _all = self
            .in_flight
            .acquire_many(self.max_in_flight as u32)
            .await
            .map_err(|e| QueueError::ConsumeFailed(format!("Semaphore closed: {}", e)))?;

        info!("Consumer stopped gracefully");
        Ok(())
    }

    fn shutdown(&self) {
        info!("Requesting consumer shutdown");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }
}

/// JetStream durable pull consumer as a batch source
pub struct PullBatchSource {
    consumer: PullConsumer,
    batch_size: usize,
    batch_window: Duration,
}

#[async_trait::async_trait]
impl BatchSource for PullBatchSource {
    type Delivery = Message;

    /// Collect up to `batch_size` messages, waiting at most `batch_window`
    async fn fetch(&self) -> Result<Vec<Message>, QueueError> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(self.batch_size)
            .expires(self.batch_window)
            .messages()
            .await
            .map_err(|e| QueueError::ConsumeFailed(format!("Failed to request batch: {}", e)))?;

        let mut messages = Vec::with_capacity(self.batch_size);
        while let Some(result) = batch.next().await {
            match result {
                Ok(message) => messages.push(message),
                Err(e) => warn!(error = %e, "Error receiving message"),
            }
        }
        Ok(messages)
    }

    fn to_raw(&self, message: &Message) -> RawNotification {
        RawNotification {
            message_id: message
                .info()
                .ok()
                .map(|info| info.stream_sequence.to_string()),
            body: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }

    async fn ack(&self, message: Message) -> Result<(), QueueError> {
        message
            .ack()
            .await
            .map_err(|e| QueueError::ConsumeFailed(format!("ack: {}", e)))
    }

    async fn nak(&self, message: Message) -> Result<(), QueueError> {
        message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| QueueError::ConsumeFailed(format!("nak: {}", e)))
    }
}

/// Pulls notification batches from JetStream
pub type NatsBatchConsumer = BatchDispatcher<PullBatchSource>;

impl BatchDispatcher<PullBatchSource> {
    /// Bind to the durable consumer described by the client's configuration
    #[instrument(skip(client, handler))]
    pub async fn connect(client: &NatsClient, handler: BatchHandler) -> Result<Self, QueueError> {
        let consumer = client.get_or_create_consumer().await?;
        let config = client.config();
        info!(batch_size = config.batch_size, "Pull consumer bound");

        let source = PullBatchSource {
            consumer,
            batch_size: config.batch_size,
            batch_window: Duration::from_millis(config.batch_window_ms),
        };
        Ok(Self::new(source, handler, config.max_concurrent_batches))
    }
}
