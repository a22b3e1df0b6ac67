// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The connection manager, channel managers, publishers and subscribers talk
//! to the broker only through the traits in this module. The production
//! implementation lives in [`crate::amqp`] and wraps lapin; tests plug in
//! in-memory doubles.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// Outcome of a publish on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// The broker accepted the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Dials the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    /// Resolves when the broker reports the connection closed or failed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A session multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Switches the channel into publisher-confirmation mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: lapin::ExchangeKind,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares a durable queue.
    async fn queue_declare(&self, name: &str) -> Result<(), AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError>;

    /// Sets the prefetch count for consumers on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Publishes one message and, when the channel is in confirm mode, waits
    /// for the broker's confirmation of that message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, AmqpError>;

    /// Starts consuming `queue` with manual acknowledgements.
    async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves when the broker closes the channel or its connection.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}
