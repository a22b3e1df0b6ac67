// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! Connection parameters and tuning knobs consumed by this crate. Loading the
//! values (files, environment, secret managers) is the host application's job;
//! this crate only reads the structure.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    ///Default: localhost
    pub host: String,
    ///Default: 5672
    pub port: u64,
    ///Default: guest
    pub user: String,
    ///Default: guest
    pub password: String,
    ///Default: "" (the broker's "/" vhost)
    pub vhost: String,
    ///Default: rabbitmq-pubsub
    pub connection_name: String,
    ///Default: 0 (channels are opened per publish)
    pub channel_pool_size: usize,
    ///Default: 10
    pub prefetch_count: u16,
    ///Default: true
    pub requeue_on_failure: bool,
    ///Default: 1000
    pub resubscribe_delay_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: Default::default(),
            connection_name: "rabbitmq-pubsub".to_owned(),
            channel_pool_size: 0,
            prefetch_count: 10,
            requeue_on_failure: true,
            resubscribe_delay_ms: 1000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RabbitMqConfig {
    /// Composes the AMQP URI from credentials, host, port and vhost.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "" | "/" => "%2f".to_owned(),
            other => other.replace('/', "%2f"),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

/// Exponential backoff policy for background reconnects. Retries never give up
/// on their own; only closing the connection manager stops them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    ///Default: 500
    pub initial_interval_ms: u64,
    ///Default: 0.5
    pub randomization_factor: f64,
    ///Default: 1.5
    pub multiplier: f64,
    ///Default: 60000
    pub max_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval_ms: 60_000,
        }
    }
}
