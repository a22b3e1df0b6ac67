// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin-backed Broker Implementation
//!
//! This module implements the [`crate::broker`] traits on top of lapin. It is
//! the only place in the crate that touches lapin's connection and channel
//! handles directly.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, PublishConfirmation,
    },
    errors::AmqpError,
    signal::Signal,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Dials RabbitMQ with lapin.
///
/// Every connection it opens carries the configured connection name, which
/// shows up in the RabbitMQ management UI.
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    /// Creates a new LapinConnector.
    ///
    /// # Parameters
    /// * `connection_name` - Name reported to the broker for each connection
    ///
    /// # Returns
    /// A connector ready to be handed to the connection manager
    pub fn new(connection_name: &str) -> Self {
        LapinConnector {
            properties: ConnectionProperties::default()
                .with_connection_name(LongString::from(connection_name.to_owned())),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    /// Opens a lapin connection to `uri`.
    ///
    /// # Parameters
    /// * `uri` - The AMQP URI, credentials and vhost included
    ///
    /// # Returns
    /// The live connection, or `ConnectionError` when the dial fails
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");

        match Connection::connect(uri, self.properties.clone()).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection::new(conn)))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// A lapin connection.
///
/// Broker-reported failures are captured through lapin's error callback and
/// surface through [`BrokerConnection::closed`].
pub struct LapinConnection {
    conn: Connection,
    failed: Signal,
}

impl LapinConnection {
    /// Wraps a lapin connection and registers its error callback.
    fn new(conn: Connection) -> Self {
        let failed = Signal::new();

        let notifier = failed.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection failure");
            notifier.fire();
        });

        LapinConnection { conn, failed }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    /// Opens a new channel on this connection.
    ///
    /// # Returns
    /// The channel, or `ChannelError` when lapin refuses to open it
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.failed.is_fired() && self.conn.status().connected()
    }

    /// Resolves on the first reported error or once the connection status
    /// stops being connected, whichever comes first.
    async fn closed(&self) {
        let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);

        tokio::select! {
            _ = self.failed.wait() => {}
            _ = async {
                loop {
                    interval.tick().await;
                    if !self.conn.status().connected() {
                        break;
                    }
                }
            } => {}
        }
    }

    /// Closes the connection with a normal reply code. Closing a connection
    /// that is already down is a no-op.
    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// A lapin channel.
///
/// Exchanges and queues declared through it are durable; consumers use
/// explicit acknowledgements.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    /// Declares a durable exchange.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    /// * `kind` - The exchange kind, custom kinds included
    /// * `args` - Declaration arguments, such as `x-delayed-type`
    ///
    /// # Returns
    /// `Ok(())` if the exchange exists with a compatible definition
    async fn exchange_declare(
        &self,
        name: &str,
        kind: lapin::ExchangeKind,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    /// Declares a durable queue without arguments.
    async fn queue_declare(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    /// Binds `queue` to `exchange` under `key`.
    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    /// Limits unacknowledged deliveries on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    /// Publishes a message and waits for its confirmation.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to
    /// * `routing_key` - The routing key of the message
    /// * `payload` - The message body
    /// * `properties` - AMQP properties, headers included
    ///
    /// # Returns
    /// The broker's confirmation, `NotRequested` outside confirm mode
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        match confirm.await {
            Ok(Confirmation::Ack(_)) => Ok(PublishConfirmation::Ack),
            Ok(Confirmation::Nack(_)) => Ok(PublishConfirmation::Nack),
            Ok(Confirmation::NotRequested) => Ok(PublishConfirmation::NotRequested),
            Err(err) => {
                error!(error = err.to_string(), "confirmation lost");
                Err(AmqpError::DeliveryNotConfirmedError(exchange.to_owned()))
            }
        }
    }

    /// Starts a consumer on `queue` with explicit acknowledgements.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume
    /// * `tag` - The consumer tag
    ///
    /// # Returns
    /// The stream of deliveries, ending when the broker cancels the consumer
    async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    data: delivery.data,
                    properties: delivery.properties,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    /// Acknowledges a single delivery.
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    /// Rejects a single delivery, requeueing it when `requeue` is set.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    /// Resolves once the channel status stops being connected.
    async fn closed(&self) {
        let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);

        loop {
            interval.tick().await;
            if !self.channel.status().connected() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
