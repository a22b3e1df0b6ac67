// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Publish/Subscribe
//!
//! Publishes and consumes messages against RabbitMQ while surviving connection
//! loss. Start from [`client::RabbitMq`], which owns the connection and the
//! publishing channels and hands out [`publisher::Publisher`],
//! [`publisher::DelayPublisher`] and [`subscriber::Subscriber`] instances.

mod otel;

#[cfg(test)]
mod mocks;

pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod signal;
pub mod subscriber;
pub mod topology;
