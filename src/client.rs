// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Provider
//!
//! [`RabbitMq`] owns one connection manager and one channel manager and hands
//! out publishers and subscribers that share them. Applications create one
//! instance per broker and close it on shutdown.
//!
//! ```no_run
//! use rabbitmq_pubsub::{client::RabbitMq, config::RabbitMqConfig, publisher::Publish};
//!
//! # async fn run() -> Result<(), rabbitmq_pubsub::errors::AmqpError> {
//! let rabbit = RabbitMq::connect(&RabbitMqConfig::default()).await?;
//!
//! let mut orders = rabbit.subscriber().subscribe("orders").await?;
//! rabbit.publisher().publish("orders", &[b"hello".to_vec()], None).await?;
//!
//! if let Some(msg) = orders.recv().await {
//!     msg.ack();
//! }
//!
//! rabbit.close().await
//! # }
//! ```

use crate::{
    amqp::LapinConnector,
    broker::Connector,
    channel::ChannelManager,
    config::RabbitMqConfig,
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeKind,
    publisher::{DelayPublisher, Publisher},
    subscriber::Subscriber,
};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct RabbitMq {
    cfg: RabbitMqConfig,
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
}

impl RabbitMq {
    /// Dials the broker described by `cfg` with lapin.
    pub async fn connect(cfg: &RabbitMqConfig) -> Result<RabbitMq, AmqpError> {
        let connector = Arc::new(LapinConnector::new(&cfg.connection_name));
        RabbitMq::with_connector(cfg, connector).await
    }

    /// Builds the provider on any [`Connector`].
    ///
    /// # Parameters
    /// * `cfg` - Broker address, pool size and subscriber tuning
    /// * `connector` - Dials the broker on start and on every reconnect
    ///
    /// # Returns
    /// A connected provider, or the first dial or channel error
    pub async fn with_connector(
        cfg: &RabbitMqConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<RabbitMq, AmqpError> {
        let connection = ConnectionManager::new(cfg, connector);
        connection.start().await?;

        let channels = match ChannelManager::new(connection.clone(), cfg.channel_pool_size).await {
            Ok(channels) => channels,
            Err(err) => {
                error!(error = err.to_string(), "failure to create channel manager");
                if let Err(close_err) = connection.close().await {
                    debug!(error = close_err.to_string(), "failure to close connection");
                }
                return Err(err);
            }
        };

        info!(
            host = cfg.host,
            channel_pool_size = cfg.channel_pool_size,
            "rabbitmq provider ready"
        );

        Ok(RabbitMq {
            cfg: cfg.clone(),
            connection,
            channels: Arc::new(channels),
        })
    }

    /// The connection manager shared by every publisher and subscriber.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Publisher through the default exchange.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.connection.clone(), self.channels.clone())
    }

    pub fn exchange_publisher(&self, kind: ExchangeKind) -> Publisher {
        Publisher::with_exchange(self.connection.clone(), self.channels.clone(), kind)
    }

    /// Publisher through delayed-message exchanges; every publish needs a
    /// delay.
    pub fn delay_publisher(&self, kind: ExchangeKind) -> DelayPublisher {
        DelayPublisher::new(self.connection.clone(), self.channels.clone(), kind)
    }

    /// Subscriber for topics published through the default exchange.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.connection.clone(), &self.cfg)
    }

    pub fn exchange_subscriber(&self, kind: ExchangeKind) -> Subscriber {
        Subscriber::with_exchange(self.connection.clone(), &self.cfg, kind)
    }

    pub fn delay_subscriber(&self, kind: ExchangeKind) -> Subscriber {
        Subscriber::delayed(self.connection.clone(), &self.cfg, kind)
    }

    /// Closes pooled channels, stops every subscription and closes the
    /// connection. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.channels.close().await;
        self.connection.close().await
    }
}
