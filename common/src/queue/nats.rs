// JetStream plumbing for the schedule change notification stream

use crate::config::NatsConfig;
use crate::errors::QueueError;
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::stream::{self, RetentionPolicy};
use async_nats::jetstream::Context;
use std::time::Duration;
use tracing::{info, instrument};

/// How long a delivered batch may stay unacknowledged before redelivery
const ACK_WAIT: Duration = Duration::from_secs(300);

/// Connection to the notification stream, shared by publishers and consumers
pub struct NatsClient {
    jetstream: Context,
    config: NatsConfig,
}

impl NatsClient {
    #[instrument(skip(config), fields(url = %config.url, stream = %config.stream_name))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        let client = async_nats::ConnectOptions::new()
            .name(config.consumer_name.as_str())
            .connect(config.url.as_str())
            .await
            .map_err(|e| QueueError::Connection(format!("{}: {}", config.url, e)))?;

        info!("Connected to NATS");

        Ok(Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        })
    }

    /// Ensure the notification stream exists.
    ///
    /// Work-queue retention: a notification leaves the stream once a
    /// reconciler acknowledges the batch it arrived in.
    #[instrument(skip(self), fields(stream = %self.config.stream_name))]
    pub async fn initialize_stream(&self) -> Result<stream::Stream, QueueError> {
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: self.config.stream_name.clone(),
                subjects: vec![self.config.subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                max_age: Duration::from_secs(self.config.max_age_seconds),
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::StreamCreation(e.to_string()))?;

        info!(subject = %self.config.subject, "Notification stream ready");
        Ok(stream)
    }

    /// Durable pull consumer shared by every reconciler instance, so each
    /// notification is handed to exactly one of them at a time
    #[instrument(skip(self), fields(consumer = %self.config.consumer_name))]
    pub async fn get_or_create_consumer(&self) -> Result<PullConsumer, QueueError> {
        let stream = self.stream().await?;

        let consumer = stream
            .get_or_create_consumer(
                &self.config.consumer_name,
                pull::Config {
                    durable_name: Some(self.config.consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::ConsumerCreation(e.to_string()))?;

        info!("Durable consumer ready");
        Ok(consumer)
    }

    async fn stream(&self) -> Result<stream::Stream, QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::StreamNotFound(format!("{}: {}", self.config.stream_name, e)))
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Subject prefix publishers append the schedule group to
    pub fn subject_prefix(&self) -> &str {
        subject_prefix(&self.config.subject)
    }
}

fn subject_prefix(subject: &str) -> &str {
    subject
        .strip_suffix(".>")
        .or_else(|| subject.strip_suffix(".*"))
        .unwrap_or(subject)
}
