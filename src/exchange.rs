// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Types for RabbitMQ
//!
//! This module defines the exchange types the crate can declare and the three
//! delivery modes a publisher or subscriber works in. Delayed delivery relies
//! on the broker's delayed-message plugin: the exchange is declared with the
//! `x-delayed-message` type and names the wrapped type in `x-delayed-type`,
//! while every delayed message carries its delay in the `x-delay` header.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Exchange argument naming the type wrapped by a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Message header carrying the delivery delay in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Exchange type registered by the delayed-message plugin
pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

/// Represents the protocol types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// How a topic is mapped onto the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeMode {
    /// Publish through the broker's nameless default exchange, which routes by
    /// queue name.
    Default,
    /// Publish through an exchange named after the topic, explicitly bound to
    /// the topic's queue.
    Explicit,
    /// Like `Explicit`, but the exchange holds every message for its `x-delay`.
    Delayed,
}

/// Exchange type and arguments to declare for a mode.
pub(crate) fn declaration(mode: ExchangeMode, kind: ExchangeKind) -> (lapin::ExchangeKind, FieldTable) {
    match mode {
        ExchangeMode::Delayed => {
            let mut params = BTreeMap::new();
            params.insert(
                ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                AMQPValue::LongString(LongString::from(kind.as_str())),
            );

            (
                lapin::ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_owned()),
                FieldTable::from(params),
            )
        }
        _ => (kind.into(), FieldTable::default()),
    }
}
