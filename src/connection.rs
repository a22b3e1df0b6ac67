// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! This module owns the single broker connection of a provider. It dials the
//! broker, watches the connection for broker-reported closure and reconnects
//! with exponential backoff until it is closed on purpose.
//!
//! Other components observe two gates:
//! - "connected", flipped on every successful dial and cleared on every loss
//! - "closing", fired exactly once by [`ConnectionManager::close`]

use crate::{
    backoff::ExponentialBackoff,
    broker::{BrokerChannel, BrokerConnection, Connector},
    config::{RabbitMqConfig, ReconnectConfig},
    errors::AmqpError,
    signal::Signal,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    uri: String,
    reconnect: ReconnectConfig,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connected: watch::Sender<bool>,
    closing: Signal,
    closed: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl ConnectionManager {
    /// Creates a manager without dialing. Call [`ConnectionManager::start`] to
    /// connect and begin watching the connection.
    pub fn new(cfg: &RabbitMqConfig, connector: Arc<dyn Connector>) -> Arc<ConnectionManager> {
        let (connected, _) = watch::channel(false);

        Arc::new(ConnectionManager {
            connector,
            uri: cfg.uri(),
            reconnect: cfg.reconnect.clone(),
            connection: RwLock::new(None),
            connected,
            closing: Signal::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Dials the broker and spawns the background task that reconnects after
    /// broker-initiated closures. Dial failures are returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.connect().await?;
        self.spawn(Arc::clone(self).watch());
        Ok(())
    }

    /// Dials the broker once and publishes the new connection. A previous
    /// connection that is still alive is closed.
    pub(crate) async fn connect(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosedError);
        }

        let conn = self.connector.connect(&self.uri).await?;

        let previous = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(conn);
        self.connected.send_replace(true);
        info!("amqp connection established");

        if let Some(previous) = previous.filter(|previous| previous.is_connected()) {
            if let Err(err) = previous.close().await {
                debug!(error = err.to_string(), "failure to close replaced connection");
            }
        }

        Ok(())
    }

    /// Retries [`ConnectionManager::connect`] under exponential backoff until
    /// it succeeds. Closing the manager abandons the retries.
    pub(crate) async fn reconnect(&self) -> Result<(), AmqpError> {
        let mut backoff = ExponentialBackoff::new(&self.reconnect);

        loop {
            if self.closing.is_fired() {
                debug!("connection closing, abandoning reconnect");
                return Err(AmqpError::ConnectionClosedError);
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(AmqpError::ConnectionClosedError) => {
                    return Err(AmqpError::ConnectionClosedError)
                }
                Err(err) => {
                    let wait = backoff.next_backoff();
                    warn!(
                        error = err.to_string(),
                        wait_ms = wait.as_millis() as u64,
                        "failure to reconnect, retrying"
                    );

                    tokio::select! {
                        _ = self.closing.wait() => {
                            debug!("connection closing, abandoning reconnect");
                            return Err(AmqpError::ConnectionClosedError);
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn watch(self: Arc<Self>) {
        loop {
            let Some(conn) = self.wait_connected().await else {
                return;
            };

            tokio::select! {
                _ = self.closing.wait() => return,
                _ = conn.closed() => {
                    self.connected.send_replace(false);
                    warn!("amqp connection lost, reconnecting");

                    if let Err(err) = self.reconnect().await {
                        debug!(error = err.to_string(), "reconnect loop finished");
                        return;
                    }
                }
            }
        }
    }

    /// Waits until a connection is available. Returns `None` once the manager
    /// is closing.
    pub(crate) async fn wait_connected(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut connected = self.connected.subscribe();

        tokio::select! {
            _ = self.closing.wait() => None,
            res = connected.wait_for(|connected| *connected) => {
                res.ok()?;
                self.current()
            }
        }
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Opens a channel on the current connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosedError);
        }

        match self.current() {
            Some(conn) if self.is_connected() && conn.is_connected() => conn.create_channel().await,
            _ => Err(AmqpError::NotConnectedError),
        }
    }

    /// Registers a background task that [`ConnectionManager::close`] waits on.
    /// Tasks that already finished are reaped first.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(res) = tasks.try_join_next() {
            if let Err(err) = res {
                error!(error = err.to_string(), "background task failure");
            }
        }

        tasks.spawn(task);
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fired once the manager starts closing.
    pub fn closing(&self) -> &Signal {
        &self.closing
    }

    /// Closes the manager: stops reconnects, waits for every dependent
    /// background task, then closes the broker connection. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!("closing amqp connection");
        self.closing.fire();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(error = err.to_string(), "background task failure");
            }
        }

        self.connected.send_replace(false);
        let conn = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{connector, FakeBroker};
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tokio::time::Instant;

    fn cfg() -> RabbitMqConfig {
        RabbitMqConfig {
            reconnect: ReconnectConfig {
                initial_interval_ms: 100,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval_ms: 1_000,
            },
            ..RabbitMqConfig::default()
        }
    }

    #[tokio::test]
    async fn start_connects_and_surfaces_dial_failures() {
        let broker = FakeBroker::new();
        let dials = Arc::new(AtomicUsize::new(0));

        let failing = ConnectionManager::new(&cfg(), Arc::new(connector(&broker, 1, dials.clone())));
        assert_eq!(
            failing.start().await,
            Err(AmqpError::ConnectionError("connection refused".to_owned()))
        );
        assert!(!failing.is_connected());

        let manager = ConnectionManager::new(&cfg(), Arc::new(connector(&broker, 0, dials)));
        assert!(manager.start().await.is_ok());
        assert!(manager.is_connected());
        assert!(!manager.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_succeeds_after_backoff_intervals() {
        let broker = FakeBroker::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(&cfg(), Arc::new(connector(&broker, 3, dials.clone())));

        let started = Instant::now();
        manager.reconnect().await.unwrap();

        // three failures wait 100ms, 200ms and 400ms before the fourth dial
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(dials.load(Ordering::SeqCst), 4);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_before_backoff_elapses() {
        let broker = FakeBroker::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(&cfg(), Arc::new(connector(&broker, 2, dials)));

        let reconnecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(!manager.is_connected());

        reconnecting.await.unwrap().unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_retries() {
        let broker = FakeBroker::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let manager =
            ConnectionManager::new(&cfg(), Arc::new(connector(&broker, usize::MAX, dials.clone())));

        let reconnecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;

        let attempts = dials.load(Ordering::SeqCst);
        let closing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.close().await })
        };
        tokio::task::yield_now().await;
        assert!(manager.is_closed());

        closing.await.unwrap().unwrap();
        assert_eq!(
            reconnecting.await.unwrap(),
            Err(AmqpError::ConnectionClosedError)
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(dials.load(Ordering::SeqCst), attempts);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_broker_closes_connection() {
        let broker = FakeBroker::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(&cfg(), Arc::new(connector(&broker, 0, dials.clone())));
        manager.start().await.unwrap();

        let conn = manager.current().unwrap();
        conn.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.is_connected());
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(manager.create_channel().await.is_ok());

        manager.close().await.unwrap();
        assert_eq!(manager.create_channel().await.err(), Some(AmqpError::ConnectionClosedError));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = FakeBroker::new();
        let manager = ConnectionManager::new(
            &cfg(),
            Arc::new(connector(&broker, 0, Arc::new(AtomicUsize::new(0)))),
        );
        manager.start().await.unwrap();

        assert!(manager.close().await.is_ok());
        assert!(manager.close().await.is_ok());
        assert!(manager.is_closed());
        assert!(manager.closing().is_fired());
    }

    #[tokio::test]
    async fn finished_tasks_are_reaped_on_spawn() {
        let broker = FakeBroker::new();
        let manager = ConnectionManager::new(
            &cfg(),
            Arc::new(connector(&broker, 0, Arc::new(AtomicUsize::new(0)))),
        );

        for _ in 0..5 {
            manager.spawn(async {});
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.spawn(std::future::pending());
        assert_eq!(manager.task_count(), 1);
    }

    #[tokio::test]
    async fn connect_closes_replaced_connection() {
        let broker = FakeBroker::new();
        let manager = ConnectionManager::new(
            &cfg(),
            Arc::new(connector(&broker, 0, Arc::new(AtomicUsize::new(0)))),
        );

        manager.connect().await.unwrap();
        let first = manager.current().unwrap();
        manager.connect().await.unwrap();

        assert!(!first.is_connected());
        assert!(manager.current().unwrap().is_connected());
        assert!(manager.is_connected());
    }
}
