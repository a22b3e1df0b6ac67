// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes batches of payloads to a topic. [`Publisher`] goes
//! through the default exchange or an explicit exchange named after the topic;
//! [`DelayPublisher`] goes through a delayed-message exchange and stamps each
//! message with its delay. Both share the same publishing core:
//!
//! 1. resolve the topology of the topic
//! 2. check the connection and check out a channel
//! 3. declare the topic once per publisher instance
//! 4. publish every payload, waiting for the broker's confirmation of each one
//! 5. hand the channel back, whatever the outcome, including when the
//!    publishing future is dropped before it completes
//!
//! A failure in the middle of a batch aborts the rest of it; messages already
//! confirmed stay on the broker.

use crate::{
    channel::{Channel, ChannelManager},
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeMode, AMQP_HEADERS_DELAY},
    otel,
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for published payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes batches of payloads to a topic.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publishes `messages` to `topic` in order.
    ///
    /// # Parameters
    /// * `topic` - The destination topic, must not be empty
    /// * `messages` - The payloads, published in this order
    /// * `delay_seconds` - Delay before delivery; required by delayed
    ///   publishers and ignored by the others
    ///
    /// # Returns
    /// `Ok(())` once the broker confirmed every message
    async fn publish(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        delay_seconds: Option<u64>,
    ) -> Result<(), AmqpError>;
}

/// Publishing logic shared by every publisher flavour.
struct PublisherCore {
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    mode: ExchangeMode,
    kind: ExchangeKind,
    declared: RwLock<HashSet<String>>,
}

impl PublisherCore {
    fn new(
        connection: Arc<ConnectionManager>,
        channels: Arc<ChannelManager>,
        mode: ExchangeMode,
        kind: ExchangeKind,
    ) -> Self {
        PublisherCore {
            connection,
            channels,
            mode,
            kind,
            declared: RwLock::new(HashSet::new()),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        delay_ms: Option<i64>,
    ) -> Result<(), AmqpError> {
        if topic.is_empty() {
            return Err(AmqpError::EmptyTopicError);
        }

        let topology = Topology::new(topic, self.mode, self.kind);

        if !self.connection.is_connected() {
            error!(topic = topic, "publishing without connection");
            return Err(AmqpError::NotConnectedError);
        }

        let lease = self.channels.lease().await?;
        let result = self
            .publish_on(lease.channel()?, &topology, messages, delay_ms)
            .await;

        if let Err(err) = lease.release().await {
            error!(error = err.to_string(), topic = topic, "failure to release channel");
        }

        result
    }

    /// Declares the topic and publishes the batch on an already checked-out
    /// channel, stopping at the first failure.
    async fn publish_on(
        &self,
        channel: &Channel,
        topology: &Topology,
        messages: &[Vec<u8>],
        delay_ms: Option<i64>,
    ) -> Result<(), AmqpError> {
        self.declare(channel, topology).await?;

        for payload in messages {
            let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
            otel::inject_current(&mut headers);

            if let Some(delay_ms) = delay_ms {
                headers.insert(
                    ShortString::from(AMQP_HEADERS_DELAY),
                    AMQPValue::LongLongInt(LongLongInt::from(delay_ms)),
                );
            }

            let properties = BasicProperties::default()
                .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
                .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                .with_headers(FieldTable::from(headers));

            channel
                .publish(&topology.exchange, &topology.routing_key, payload, properties)
                .await
                .inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        topic = topology.queue,
                        "error publishing message"
                    )
                })?;
        }

        debug!(topic = topology.queue, count = messages.len(), "messages published");
        Ok(())
    }

    /// Declares the topic's destination once per publisher: the queue for the
    /// default exchange, the exchange otherwise.
    async fn declare(&self, channel: &Channel, topology: &Topology) -> Result<(), AmqpError> {
        if self.declared.read().await.contains(&topology.queue) {
            return Ok(());
        }

        let mut declared = self.declared.write().await;
        if declared.contains(&topology.queue) {
            return Ok(());
        }

        match self.mode {
            ExchangeMode::Default => topology.declare_queue(channel.broker()).await?,
            _ => topology.declare_exchange(channel.broker()).await?,
        }

        declared.insert(topology.queue.clone());
        Ok(())
    }
}

/// Publishes through the default exchange or an explicit exchange per topic.
pub struct Publisher {
    core: PublisherCore,
}

impl Publisher {
    /// Publisher routing through the broker's default exchange.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `channels` - The channel strategy publishes run on
    pub fn new(connection: Arc<ConnectionManager>, channels: Arc<ChannelManager>) -> Publisher {
        Publisher {
            core: PublisherCore::new(
                connection,
                channels,
                ExchangeMode::Default,
                ExchangeKind::Direct,
            ),
        }
    }

    /// Publisher routing through an exchange named after each topic.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `channels` - The channel strategy publishes run on
    /// * `kind` - Kind of the exchange declared per topic
    pub fn with_exchange(
        connection: Arc<ConnectionManager>,
        channels: Arc<ChannelManager>,
        kind: ExchangeKind,
    ) -> Publisher {
        Publisher {
            core: PublisherCore::new(connection, channels, ExchangeMode::Explicit, kind),
        }
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        _delay_seconds: Option<u64>,
    ) -> Result<(), AmqpError> {
        self.core.publish(topic, messages, None).await
    }
}

/// Publishes through a delayed-message exchange per topic.
pub struct DelayPublisher {
    core: PublisherCore,
}

impl DelayPublisher {
    /// Publisher routing through a delayed-message exchange per topic.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `channels` - The channel strategy publishes run on
    /// * `kind` - Routing kind applied once the delay is over
    pub fn new(
        connection: Arc<ConnectionManager>,
        channels: Arc<ChannelManager>,
        kind: ExchangeKind,
    ) -> DelayPublisher {
        DelayPublisher {
            core: PublisherCore::new(connection, channels, ExchangeMode::Delayed, kind),
        }
    }
}

#[async_trait]
impl Publish for DelayPublisher {
    async fn publish(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        delay_seconds: Option<u64>,
    ) -> Result<(), AmqpError> {
        let Some(delay_seconds) = delay_seconds else {
            error!(topic = topic, "delayed publish without delay");
            return Err(AmqpError::MissingDelayError(topic.to_owned()));
        };

        let delay_ms = i64::try_from(delay_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        self.core.publish(topic, messages, Some(delay_ms)).await
    }
}
