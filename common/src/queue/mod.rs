// Queue module for the schedule change notification stream

pub mod consumer;
pub mod nats;
pub mod publisher;

pub use consumer::{
    BatchConsumer, BatchDispatcher, BatchHandler, BatchSource, NatsBatchConsumer, PullBatchSource,
};
pub use nats::NatsClient;
pub use publisher::{dedup_id, to_envelope, NatsNotificationPublisher, NotificationPublisher};
