// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Publish/Subscribe Layer
//!
//! This module provides the error taxonomy for every operation of the crate.
//! The `AmqpError` enum groups connectivity, channel, declaration, publishing,
//! consumer and usage failures. Variants carry plain strings so that errors
//! stay comparable and cloneable regardless of the broker client underneath.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Synchronous operations (publish, subscribe setup) return these errors to the
/// caller. Errors raised inside background tasks (reconnect loops, subscription
/// loops) are logged and absorbed instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection manager has no live connection at the moment
    #[error("not connected")]
    NotConnectedError,

    /// The connection manager was closed and will not reconnect
    #[error("connection closed")]
    ConnectionClosedError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel pool was closed while acquiring a channel
    #[error("channel pool closed")]
    ChannelPoolClosedError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker refused, or never confirmed, a published message
    #[error("delivery not confirmed for topic `{0}`")]
    DeliveryNotConfirmedError(String),

    /// A delayed publish was requested without a delay
    #[error("delayed publish to `{0}` requires a delay")]
    MissingDelayError(String),

    /// A publish or subscribe was requested with an empty topic
    #[error("topic must not be empty")]
    EmptyTopicError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The subscriber was closed and accepts no new subscriptions
    #[error("subscriber closed")]
    SubscriberClosedError,
}
