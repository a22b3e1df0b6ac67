// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Subscriber
//!
//! This module turns a topic's queue into a lazy stream of [`Message`]s. Each
//! subscription owns a dedicated, never pooled, channel and a background task
//! that moves through these states:
//!
//! ```text
//! Declaring -> Consuming <-> ReconnectWait
//!                  |              |
//!                  +--> Closed <--+
//! ```
//!
//! - Declaring happens synchronously in [`Subscriber::subscribe`] on a short
//!   lived channel, so declaration errors reach the caller.
//! - Consuming opens the dedicated channel, applies the prefetch count and
//!   forwards deliveries one by one. A delivery is acknowledged on the broker
//!   only after the application acked or nacked its message, so broker acks
//!   follow forwarding order.
//! - ReconnectWait is entered when the broker closes the channel or its
//!   connection, when the delivery stream fails or ends, or when an ack/nack
//!   cannot be delivered. After a short delay the task goes back to Consuming
//!   on a fresh channel; the stream stays open.
//!
//! Whatever ends a consuming cycle, its dedicated channel is closed before the
//! next state starts, so unacknowledged deliveries return to the queue.
//! - Closed is reached when the subscription is cancelled or dropped, the
//!   subscriber is closed, or the connection manager is closing. The stream
//!   then ends.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream},
    config::RabbitMqConfig,
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeMode},
    message::{Finalization, Message},
    otel,
    signal::Signal,
    topology::Topology,
};
use futures_util::{Stream, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumes topics declared with one delivery mode.
///
/// Every call to [`Subscriber::subscribe`] starts an independent
/// subscription; [`Subscriber::close`] stops all of them.
pub struct Subscriber {
    connection: Arc<ConnectionManager>,
    mode: ExchangeMode,
    kind: ExchangeKind,
    prefetch_count: u16,
    requeue_on_failure: bool,
    resubscribe_delay: Duration,
    closing: Signal,
    closed: AtomicBool,
}

impl Subscriber {
    /// Subscriber for topics published through the default exchange.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `cfg` - Prefetch count, requeue policy and resubscribe delay
    pub fn new(connection: Arc<ConnectionManager>, cfg: &RabbitMqConfig) -> Subscriber {
        Subscriber::with_mode(connection, cfg, ExchangeMode::Default, ExchangeKind::Direct)
    }

    /// Subscriber for topics published through an explicit exchange.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `cfg` - Prefetch count, requeue policy and resubscribe delay
    /// * `kind` - Kind of the exchange declared per topic
    pub fn with_exchange(
        connection: Arc<ConnectionManager>,
        cfg: &RabbitMqConfig,
        kind: ExchangeKind,
    ) -> Subscriber {
        Subscriber::with_mode(connection, cfg, ExchangeMode::Explicit, kind)
    }

    /// Subscriber for topics published through a delayed-message exchange.
    ///
    /// # Parameters
    /// * `connection` - The shared connection manager
    /// * `cfg` - Prefetch count, requeue policy and resubscribe delay
    /// * `kind` - Routing kind the delayed exchange applies once the delay is over
    pub fn delayed(
        connection: Arc<ConnectionManager>,
        cfg: &RabbitMqConfig,
        kind: ExchangeKind,
    ) -> Subscriber {
        Subscriber::with_mode(connection, cfg, ExchangeMode::Delayed, kind)
    }

    fn with_mode(
        connection: Arc<ConnectionManager>,
        cfg: &RabbitMqConfig,
        mode: ExchangeMode,
        kind: ExchangeKind,
    ) -> Subscriber {
        Subscriber {
            connection,
            mode,
            kind,
            prefetch_count: cfg.prefetch_count,
            requeue_on_failure: cfg.requeue_on_failure,
            resubscribe_delay: cfg.resubscribe_delay(),
            closing: Signal::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Declares the topic and starts consuming it in the background.
    ///
    /// # Parameters
    /// * `topic` - The topic to consume, also the queue name
    ///
    /// # Returns
    /// The stream of messages, or the error raised while declaring the topic.
    /// Connection problems after this point never end the stream.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, AmqpError> {
        if topic.is_empty() {
            return Err(AmqpError::EmptyTopicError);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::SubscriberClosedError);
        }

        let topology = Topology::new(topic, self.mode, self.kind);

        let channel = self.connection.create_channel().await?;
        let declared = topology.install(channel.as_ref()).await;
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close declaration channel");
        }
        declared.inspect_err(|err| {
            error!(error = err.to_string(), topic = topic, "failure to declare topology")
        })?;

        let (sender, receiver) = mpsc::channel(1);
        let cancel = Signal::new();

        let consumer = SubscriptionLoop {
            connection: self.connection.clone(),
            tag: format!("{}-{}", topology.queue, Uuid::new_v4()),
            topology,
            sender,
            prefetch_count: self.prefetch_count,
            requeue_on_failure: self.requeue_on_failure,
            resubscribe_delay: self.resubscribe_delay,
            cancel: cancel.clone(),
            subscriber_closing: self.closing.clone(),
            connection_closing: self.connection.closing().clone(),
        };
        self.connection.spawn(consumer.run());

        info!(topic = topic, "subscribed");
        Ok(Subscription { receiver, cancel })
    }

    /// Stops every subscription of this subscriber. Idempotent.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("closing subscriber");
            self.closing.fire();
        }
    }
}

/// Stream of messages of one subscription. Cancelling or dropping it stops
/// the subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
    cancel: Signal,
}

impl Subscription {
    /// Waits for the next message. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Stops the subscription. Messages still being processed see their
    /// [`Message::context`] fire; the stream ends after buffered messages.
    pub fn cancel(&self) {
        self.cancel.fire();
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.fire();
    }
}

/// States of a subscription's background task.
enum State {
    Consuming,
    ReconnectWait,
    Closed,
}

/// Background task of one subscription.
struct SubscriptionLoop {
    connection: Arc<ConnectionManager>,
    topology: Topology,
    tag: String,
    sender: mpsc::Sender<Message>,
    prefetch_count: u16,
    requeue_on_failure: bool,
    resubscribe_delay: Duration,
    cancel: Signal,
    subscriber_closing: Signal,
    connection_closing: Signal,
}

impl SubscriptionLoop {
    /// Drives the state machine until the subscription is closed. Dropping the
    /// sender on exit ends the stream.
    async fn run(self) {
        let mut state = State::Consuming;

        loop {
            state = match state {
                State::Consuming => self.consume().await,
                State::ReconnectWait => self.wait_before_resubscribe().await,
                State::Closed => break,
            };
        }

        debug!(queue = self.topology.queue, "subscription closed");
    }

    /// Resolves when any of the subscription, the subscriber or the connection
    /// stops, or when the stream's receiver is gone.
    async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.wait() => {}
            _ = self.subscriber_closing.wait() => {}
            _ = self.connection_closing.wait() => {}
            _ = self.sender.closed() => {}
        }
    }

    async fn wait_before_resubscribe(&self) -> State {
        debug!(
            queue = self.topology.queue,
            delay_ms = self.resubscribe_delay.as_millis() as u64,
            "waiting before resubscribing"
        );

        tokio::select! {
            _ = self.cancelled() => State::Closed,
            _ = tokio::time::sleep(self.resubscribe_delay) => State::Consuming,
        }
    }

    async fn consume(&self) -> State {
        let connected = tokio::select! {
            _ = self.cancelled() => None,
            conn = self.connection.wait_connected() => conn,
        };
        if connected.is_none() {
            return State::Closed;
        }

        let (channel, mut deliveries) = match self.open_consumer().await {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.topology.queue,
                    "failure to start consuming"
                );
                return State::ReconnectWait;
            }
        };

        let next = self.deliver(channel.as_ref(), &mut deliveries).await;

        // unacked deliveries of this channel go back to the queue on close
        drop(deliveries);
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close consumer channel");
        }

        next
    }

    async fn open_consumer(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        let channel = self.connection.create_channel().await?;

        let consumer = async {
            channel.basic_qos(self.prefetch_count).await?;
            channel.basic_consume(&self.topology.queue, &self.tag).await
        }
        .await;

        match consumer {
            Ok(deliveries) => {
                debug!(queue = self.topology.queue, tag = self.tag, "consuming");
                Ok((channel, deliveries))
            }
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "failure to close consumer channel");
                }
                Err(err)
            }
        }
    }

    async fn deliver(&self, channel: &dyn BrokerChannel, deliveries: &mut DeliveryStream) -> State {
        loop {
            let delivery = tokio::select! {
                _ = self.cancelled() => return State::Closed,
                _ = channel.closed() => {
                    warn!(queue = self.topology.queue, "consumer channel closed by the broker");
                    return State::ReconnectWait;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        error!(error = err.to_string(), queue = self.topology.queue, "errors consume msg");
                        return State::ReconnectWait;
                    }
                    None => {
                        warn!(queue = self.topology.queue, "delivery stream ended");
                        return State::ReconnectWait;
                    }
                },
            };

            if let Some(next) = self.handle(channel, delivery).await {
                return next;
            }
        }
    }

    /// Forwards one delivery and settles it on the broker once the application
    /// finalized it. Returns the next state when the consuming cycle must end.
    async fn handle(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Option<State> {
        let tracer = global::tracer("amqp subscriber");
        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &self.topology.queue);

        debug!(
            queue = self.topology.queue,
            delivery_tag = delivery.delivery_tag,
            "received"
        );

        let tag = delivery.delivery_tag;
        let scope = Signal::new();
        let message = Message::new(delivery.data, tag, delivery.redelivered, scope.clone(), ctx);
        let mut finalization = message.watch();

        tokio::select! {
            _ = self.cancelled() => return Some(State::Closed),
            sent = self.sender.send(message) => {
                if sent.is_err() {
                    return Some(State::Closed);
                }
            }
        }

        let outcome = tokio::select! {
            _ = self.cancelled() => {
                // left unacked: the broker requeues it once the channel closes
                scope.fire();
                span.set_status(Status::Error {
                    description: Cow::from("subscription closed before finalization"),
                });
                return Some(State::Closed);
            }
            res = finalization.wait_for(|state| *state != Finalization::Pending) => match res {
                Ok(state) => *state,
                Err(_) => {
                    warn!(delivery_tag = tag, "message dropped without ack or nack");
                    Finalization::Nacked
                }
            },
        };

        let settled = match outcome {
            Finalization::Acked => channel.basic_ack(tag).await,
            _ => channel.basic_nack(tag, self.requeue_on_failure).await,
        };

        match settled {
            Ok(()) => {
                match outcome {
                    Finalization::Acked => span.set_status(Status::Ok),
                    _ => span.set_status(Status::Error {
                        description: Cow::from("message nacked"),
                    }),
                }
                None
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = tag,
                    "failure to settle delivery, resubscribing"
                );
                span.record_error(&err);
                Some(State::ReconnectWait)
            }
        }
    }
}
