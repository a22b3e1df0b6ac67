// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker doubles shared by the unit tests.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Delivery, DeliveryStream, MockConnector,
        PublishConfirmation,
    },
    errors::AmqpError,
    signal::Signal,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc;

/// Everything the fake broker observed, shared by all fake connections and
/// channels created from the same [`FakeBroker`].
#[derive(Debug, Default)]
pub struct BrokerLog {
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub exchanges: Vec<(String, String, FieldTable)>,
    pub queues: Vec<String>,
    pub bindings: Vec<(String, String, String)>,
    pub published: Vec<(String, String, Vec<u8>, BasicProperties)>,
    pub acked: Vec<u64>,
    pub nacked: Vec<(u64, bool)>,
    pub consumers: Vec<String>,
    pub qos: Vec<u16>,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    pub log: Arc<Mutex<BrokerLog>>,
    pub confirmation: Arc<Mutex<Option<PublishConfirmation>>>,
    pub fail_exchange_declare: Arc<Mutex<bool>>,
    /// Publishes never get a confirmation while set.
    pub hang_publish: Arc<Mutex<bool>>,
    deliveries: Arc<Mutex<Vec<mpsc::UnboundedSender<Result<Delivery, AmqpError>>>>>,
    channels: Arc<Mutex<Vec<Arc<FakeChannel>>>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker::default()
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, BrokerLog> {
        self.log.lock().unwrap()
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        Arc::new(FakeConnection {
            broker: self.clone(),
            failed: Signal::new(),
        })
    }

    /// Pushes a delivery to the most recent consumer.
    pub fn deliver(&self, tag: u64, data: &[u8]) {
        let deliveries = self.deliveries.lock().unwrap();
        let sender = deliveries.last().expect("no consumer registered");
        sender
            .send(Ok(Delivery {
                delivery_tag: tag,
                redelivered: false,
                data: data.to_vec(),
                properties: BasicProperties::default(),
            }))
            .unwrap();
    }

    /// Fails the delivery stream of the most recent consumer.
    pub fn fail_deliveries(&self, reason: &str) {
        let deliveries = self.deliveries.lock().unwrap();
        let sender = deliveries.last().expect("no consumer registered");
        sender
            .send(Err(AmqpError::ConsumerError(reason.to_owned())))
            .unwrap();
    }

    /// Ends every delivery stream, as a broker-side consumer cancel does.
    pub fn end_deliveries(&self) {
        self.deliveries.lock().unwrap().clear();
    }

    /// Number of consumers registered so far, ended ones included.
    pub fn consumer_count(&self) -> usize {
        self.log().consumers.len()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }
}

/// A [`MockConnector`] that hands out fake connections after `failures`
/// failed dials, counting every dial in `dials`.
pub fn connector(broker: &FakeBroker, failures: usize, dials: Arc<AtomicUsize>) -> MockConnector {
    let broker = broker.clone();
    let mut connector = MockConnector::new();
    connector.expect_connect().returning(move |_| {
        let attempt = dials.fetch_add(1, Ordering::SeqCst);
        if attempt < failures {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }
        Ok(broker.connection() as Arc<dyn BrokerConnection>)
    });
    connector
}

pub struct FakeConnection {
    broker: FakeBroker,
    pub failed: Signal,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.failed.is_fired() {
            return Err(AmqpError::ChannelError("connection lost".to_owned()));
        }

        self.broker.log().channels_opened += 1;
        let channel = Arc::new(FakeChannel {
            broker: self.broker.clone(),
            closed: Signal::new(),
            confirms: Mutex::new(false),
        });
        self.broker.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn is_connected(&self) -> bool {
        !self.failed.is_fired()
    }

    async fn closed(&self) {
        self.failed.wait().await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.failed.fire();
        Ok(())
    }
}

pub struct FakeChannel {
    broker: FakeBroker,
    pub closed: Signal,
    confirms: Mutex<bool>,
}

impl FakeChannel {
    /// Simulates a broker-initiated channel closure.
    pub fn kill(&self) {
        self.closed.fire();
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        *self.confirms.lock().unwrap() = true;
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: lapin::ExchangeKind,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        if *self.broker.fail_exchange_declare.lock().unwrap() {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }

        let kind = match kind {
            lapin::ExchangeKind::Custom(custom) => custom,
            other => format!("{:?}", other).to_lowercase(),
        };
        self.broker.log().exchanges.push((name.to_owned(), kind, args));
        Ok(())
    }

    async fn queue_declare(&self, name: &str) -> Result<(), AmqpError> {
        self.broker.log().queues.push(name.to_owned());
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        self.broker
            .log()
            .bindings
            .push((queue.to_owned(), exchange.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.broker.log().qos.push(prefetch_count);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, AmqpError> {
        if self.closed.is_fired() {
            return Err(AmqpError::PublishingError("channel closed".to_owned()));
        }

        let hang = *self.broker.hang_publish.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }

        self.broker.log().published.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
            properties,
        ));

        if !*self.confirms.lock().unwrap() {
            return Ok(PublishConfirmation::NotRequested);
        }
        Ok(self
            .broker
            .confirmation
            .lock()
            .unwrap()
            .unwrap_or(PublishConfirmation::Ack))
    }

    async fn basic_consume(&self, queue: &str, _tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.deliveries.lock().unwrap().push(tx);
        self.broker.log().consumers.push(queue.to_owned());

        let closed = self.closed.clone();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .take_until(async move { closed.wait().await });

        Ok(stream.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if self.closed.is_fired() {
            return Err(AmqpError::AckMessageError);
        }
        self.broker.log().acked.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if self.closed.is_fired() {
            return Err(AmqpError::NackMessageError);
        }
        self.broker.log().nacked.push((delivery_tag, requeue));
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.is_fired()
    }

    async fn closed(&self) {
        self.closed.wait().await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.fire() {
            self.broker.log().channels_closed += 1;
        }
        Ok(())
    }
}
