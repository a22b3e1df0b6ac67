// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module hands out broker channels to publishers. Two strategies share
//! the same `get_channel` / `close_channel` / `close` contract:
//!
//! - **Ephemeral**: a confirm-mode channel is opened per operation and closed
//!   right after it.
//! - **Pooled**: a fixed number of confirm-mode channels is opened eagerly and
//!   recycled through a bounded queue. At most `size` channels are checked out
//!   at once, so the pool also throttles concurrent publishers. Channels closed
//!   by the broker are reopened transparently before they are handed out.
//!
//! Every channel carries at most one in-flight confirmation: publishers send a
//! message and wait for its confirmation before sending the next one on the
//! same channel.
//!
//! Publishers check channels out through [`ChannelManager::lease`]. A
//! [`ChannelLease`] dropped before it is released, for instance when the
//! publishing future is cancelled, still hands its channel back: pooled
//! channels return to the pool, ephemeral ones are closed in the background.

use crate::{
    broker::{BrokerChannel, PublishConfirmation},
    connection::ConnectionManager,
    errors::AmqpError,
    signal::Signal,
};
use lapin::BasicProperties;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// A broker channel checked out from a [`ChannelManager`].
pub struct Channel {
    inner: Arc<dyn BrokerChannel>,
    confirms: bool,
}

impl Channel {
    /// Opens a channel on the current connection and puts it in confirm mode.
    ///
    /// # Parameters
    /// * `connection` - The connection manager owning the broker connection
    ///
    /// # Returns
    /// A confirm-mode channel or the error raised while opening it
    async fn open(connection: &ConnectionManager) -> Result<Channel, AmqpError> {
        let inner = connection.create_channel().await?;
        inner.confirm_select().await?;

        Ok(Channel {
            inner,
            confirms: true,
        })
    }

    /// Whether the broker confirms every publish on this channel.
    pub fn confirms(&self) -> bool {
        self.confirms
    }

    /// Whether the broker still considers this channel open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// The underlying broker channel, used for declarations.
    pub(crate) fn broker(&self) -> &dyn BrokerChannel {
        self.inner.as_ref()
    }

    /// Publishes one message. On a confirm-mode channel this blocks until the
    /// broker confirms it and fails on a negative or missing confirmation.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to, `""` for the default one
    /// * `routing_key` - The routing key of the message
    /// * `payload` - The message body
    /// * `properties` - AMQP properties, headers included
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirmation = self
            .inner
            .basic_publish(exchange, routing_key, payload, properties)
            .await?;

        match confirmation {
            PublishConfirmation::Ack => Ok(()),
            PublishConfirmation::NotRequested if !self.confirms => Ok(()),
            other => {
                error!(
                    exchange = exchange,
                    routing_key = routing_key,
                    confirmation = format!("{:?}", other),
                    "delivery not confirmed"
                );
                Err(AmqpError::DeliveryNotConfirmedError(routing_key.to_owned()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }
}

/// Source of channels for publishers, selected by configuration.
pub enum ChannelManager {
    Ephemeral(EphemeralChannels),
    Pooled(ChannelPool),
}

impl ChannelManager {
    /// Builds the pooled strategy for `pool_size > 0`, the ephemeral one
    /// otherwise.
    pub async fn new(
        connection: Arc<ConnectionManager>,
        pool_size: usize,
    ) -> Result<ChannelManager, AmqpError> {
        if pool_size == 0 {
            return Ok(ChannelManager::Ephemeral(EphemeralChannels::new(connection)));
        }

        Ok(ChannelManager::Pooled(
            ChannelPool::new(connection, pool_size).await?,
        ))
    }

    /// Checks a channel out. Prefer [`ChannelManager::lease`], which hands
    /// the channel back even if the caller is cancelled.
    pub async fn get_channel(&self) -> Result<Channel, AmqpError> {
        match self {
            ChannelManager::Ephemeral(channels) => channels.get_channel().await,
            ChannelManager::Pooled(pool) => pool.get_channel().await,
        }
    }

    /// Hands a checked-out channel back: closes it for the ephemeral strategy,
    /// returns it to the pool otherwise.
    pub async fn close_channel(&self, channel: Channel) -> Result<(), AmqpError> {
        match self {
            ChannelManager::Ephemeral(channels) => channels.close_channel(channel).await,
            ChannelManager::Pooled(pool) => pool.close_channel(channel).await,
        }
    }

    /// Checks a channel out behind a guard that hands it back on drop.
    pub async fn lease(self: &Arc<Self>) -> Result<ChannelLease, AmqpError> {
        let channel = self.get_channel().await?;

        Ok(ChannelLease {
            manager: Arc::clone(self),
            channel: Some(channel),
        })
    }

    /// Hands a channel back without awaiting, for guards dropped mid-operation.
    fn release_detached(&self, channel: Channel) {
        match self {
            ChannelManager::Ephemeral(_) => close_detached(channel),
            ChannelManager::Pooled(pool) => pool.release_detached(channel),
        }
    }

    /// Closes the strategy. For the pool this closes every idle channel and
    /// fails pending and future checkouts.
    pub async fn close(&self) {
        match self {
            ChannelManager::Ephemeral(_) => {}
            ChannelManager::Pooled(pool) => pool.close().await,
        }
    }
}

/// A channel checked out from a [`ChannelManager`], handed back when released
/// or dropped.
pub struct ChannelLease {
    manager: Arc<ChannelManager>,
    channel: Option<Channel>,
}

impl ChannelLease {
    /// The leased channel.
    pub fn channel(&self) -> Result<&Channel, AmqpError> {
        self.channel.as_ref().ok_or(AmqpError::InternalError)
    }

    /// Hands the channel back to its manager.
    pub async fn release(mut self) -> Result<(), AmqpError> {
        match self.channel.take() {
            Some(channel) => self.manager.close_channel(channel).await,
            None => Ok(()),
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!("channel lease dropped before release");
            self.manager.release_detached(channel);
        }
    }
}

fn close_detached(channel: Channel) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "failure to close abandoned channel");
                }
            });
        }
        Err(_) => warn!("no runtime to close abandoned channel"),
    }
}

/// Opens a confirm-mode channel per operation and closes it afterwards.
pub struct EphemeralChannels {
    connection: Arc<ConnectionManager>,
}

impl EphemeralChannels {
    /// Creates the ephemeral strategy.
    ///
    /// # Parameters
    /// * `connection` - The connection channels are opened on
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        EphemeralChannels { connection }
    }

    /// Opens a fresh confirm-mode channel, refusing to hand out one that is
    /// already dead.
    pub async fn get_channel(&self) -> Result<Channel, AmqpError> {
        if !self.connection.is_connected() {
            return Err(AmqpError::NotConnectedError);
        }

        let channel = Channel::open(&self.connection).await?;
        if !channel.is_open() {
            return Err(AmqpError::ChannelError("channel closed on open".to_owned()));
        }

        Ok(channel)
    }

    /// Closes the channel.
    pub async fn close_channel(&self, channel: Channel) -> Result<(), AmqpError> {
        channel.close().await
    }
}

/// A bounded set of confirm-mode channels recycled between publishers.
pub struct ChannelPool {
    connection: Arc<ConnectionManager>,
    size: usize,
    sender: mpsc::Sender<Channel>,
    receiver: Mutex<mpsc::Receiver<Channel>>,
    closing: Signal,
    closed: AtomicBool,
}

impl ChannelPool {
    /// Eagerly opens `size` confirm-mode channels.
    ///
    /// # Parameters
    /// * `connection` - The connection channels are opened on
    /// * `size` - Number of channels, at least one
    ///
    /// # Returns
    /// The filled pool, or the first error met while opening channels
    pub async fn new(
        connection: Arc<ConnectionManager>,
        size: usize,
    ) -> Result<ChannelPool, AmqpError> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size);

        for _ in 0..size {
            let channel = Channel::open(&connection).await?;
            sender
                .try_send(channel)
                .map_err(|_| AmqpError::InternalError)?;
        }
        debug!(size = size, "channel pool created");

        Ok(ChannelPool {
            connection,
            size,
            sender,
            receiver: Mutex::new(receiver),
            closing: Signal::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of channels the pool holds.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Waits for an idle channel, reopening it if the broker closed it in the
    /// meantime. Fails once the pool is closing.
    pub async fn get_channel(&self) -> Result<Channel, AmqpError> {
        let checkout = async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };

        let channel = tokio::select! {
            _ = self.closing.wait() => return Err(AmqpError::ChannelPoolClosedError),
            channel = checkout => channel.ok_or(AmqpError::ChannelPoolClosedError)?,
        };

        if channel.is_open() {
            return Ok(channel);
        }

        warn!("pooled channel closed by the broker, reopening");
        match Channel::open(&self.connection).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                // keep the slot so the pool does not shrink
                self.release(channel).await;
                Err(err)
            }
        }
    }

    /// Returns a channel to the pool. Channels returned after the pool closed
    /// are closed instead.
    pub async fn close_channel(&self, channel: Channel) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return channel.close().await;
        }

        self.release(channel).await;
        Ok(())
    }

    async fn release(&self, channel: Channel) {
        if let Err(err) = self.sender.try_send(channel) {
            let channel = err.into_inner();
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "failure to close surplus channel");
            }
        }
    }

    /// Returns a channel without awaiting. Closes it in the background when
    /// the pool is closed or full.
    fn release_detached(&self, channel: Channel) {
        if self.closed.load(Ordering::SeqCst) {
            return close_detached(channel);
        }

        if let Err(err) = self.sender.try_send(channel) {
            close_detached(err.into_inner());
        }
    }

    /// Closes the pool: unblocks pending `get_channel` calls and closes every
    /// idle channel. Idempotent.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.closing.fire();

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(channel) = receiver.try_recv() {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "failure to close pooled channel");
            }
        }
        debug!("channel pool closed");
    }
}
