// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module resolves a topic and a delivery mode into the exchange, queue
//! and keys used on the broker, and declares them.
//!
//! | mode     | exchange | queue | routing key | binding key |
//! |----------|----------|-------|-------------|-------------|
//! | default  | `""`     | topic | topic       | topic       |
//! | explicit | topic    | topic | `""`        | `""`        |
//! | delayed  | topic    | topic | topic       | topic       |
//!
//! The default exchange binds every queue implicitly under its own name, so
//! nothing is declared or bound for it besides the queue. Every declaration is
//! idempotent on the broker; a conflicting pre-existing declaration fails the
//! calling operation.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::{self, ExchangeKind, ExchangeMode},
};
use tracing::debug;

/// Broker names resolved for one topic and delivery mode.
///
/// The same topic, mode and kind always resolve to the same names, so
/// publishers and subscribers agree without sharing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Exchange messages are published to, `""` for the default exchange
    pub exchange: String,
    /// Delivery mode the names were resolved for
    pub mode: ExchangeMode,
    /// Kind of the declared exchange, unused in default mode
    pub kind: ExchangeKind,
    /// Queue consumed by subscribers, always the topic
    pub queue: String,
    /// Routing key used when publishing
    pub routing_key: String,
    /// Key binding the queue to the exchange
    pub binding_key: String,
}

impl Topology {
    /// Resolves the topology of a topic.
    ///
    /// # Parameters
    /// * `topic` - The topic name
    /// * `mode` - Default, explicit or delayed exchange
    /// * `kind` - The exchange kind for explicit and delayed modes
    ///
    /// # Returns
    /// The resolved names. Nothing is declared on the broker.
    pub fn new(topic: &str, mode: ExchangeMode, kind: ExchangeKind) -> Topology {
        let (exchange, routing_key) = match mode {
            ExchangeMode::Default => ("", topic),
            ExchangeMode::Explicit => (topic, ""),
            ExchangeMode::Delayed => (topic, topic),
        };

        Topology {
            exchange: exchange.to_owned(),
            mode,
            kind,
            queue: topic.to_owned(),
            routing_key: routing_key.to_owned(),
            binding_key: routing_key.to_owned(),
        }
    }

    /// Declares the exchange. The default exchange always exists.
    ///
    /// Delayed mode declares an `x-delayed-message` exchange carrying the
    /// routing kind in its `x-delayed-type` argument.
    ///
    /// # Parameters
    /// * `channel` - The channel the declaration is sent on
    ///
    /// # Returns
    /// `DeclareExchangeError` when the broker rejects the declaration
    pub async fn declare_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.mode == ExchangeMode::Default {
            return Ok(());
        }

        debug!(exchange = self.exchange, "declaring exchange");
        let (kind, args) = exchange::declaration(self.mode, self.kind);
        channel.exchange_declare(&self.exchange, kind, args).await
    }

    /// Declares the durable queue of the topic.
    ///
    /// # Parameters
    /// * `channel` - The channel the declaration is sent on
    ///
    /// # Returns
    /// `DeclareQueueError` when the broker rejects the declaration
    pub async fn declare_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!(queue = self.queue, "declaring queue");
        channel.queue_declare(&self.queue).await
    }

    /// Binds the queue to the exchange. The default exchange binds implicitly.
    ///
    /// # Parameters
    /// * `channel` - The channel the binding is sent on
    ///
    /// # Returns
    /// `BindingExchangeToQueueError` when the broker rejects the binding
    pub async fn bind_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.mode == ExchangeMode::Default {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.queue, self.exchange, self.binding_key
        );
        channel
            .queue_bind(&self.queue, &self.exchange, &self.binding_key)
            .await
    }

    /// Declares the exchange, the queue and the binding between them.
    ///
    /// Stops at the first failing step; the steps already applied stay on the
    /// broker and are idempotent on the next attempt.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.declare_exchange(channel).await?;
        self.declare_queue(channel).await?;
        self.bind_queue(channel).await
    }
}
