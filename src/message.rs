// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! A [`Message`] is handed to the application for every broker delivery. The
//! application finalizes it exactly once with [`Message::ack`] or
//! [`Message::nack`]; the subscription loop waits for that decision before it
//! acknowledges the delivery on the broker.

use crate::signal::Signal;
use opentelemetry::Context;
use tokio::sync::watch;
use tracing::warn;

/// How the consumer finalized a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Pending,
    Acked,
    Nacked,
}

pub struct Message {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    state: watch::Sender<Finalization>,
    scope: Signal,
    trace_context: Context,
}

impl Message {
    pub(crate) fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        scope: Signal,
        trace_context: Context,
    ) -> Message {
        let (state, _) = watch::channel(Finalization::Pending);

        Message {
            payload,
            delivery_tag,
            redelivered,
            state,
            scope,
            trace_context,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Marks the message as processed. Returns `false` if it was nacked.
    pub fn ack(&self) -> bool {
        self.finalize(Finalization::Acked)
    }

    /// Marks the message as failed. Returns `false` if it was acked.
    pub fn nack(&self) -> bool {
        self.finalize(Finalization::Nacked)
    }

    fn finalize(&self, outcome: Finalization) -> bool {
        let mut accepted = false;

        self.state.send_if_modified(|state| match *state {
            Finalization::Pending => {
                *state = outcome;
                accepted = true;
                true
            }
            current => {
                accepted = current == outcome;
                false
            }
        });

        if !accepted {
            warn!(
                delivery_tag = self.delivery_tag,
                requested = format!("{:?}", outcome),
                "message already finalized"
            );
        }

        accepted
    }

    pub fn finalization(&self) -> Finalization {
        *self.state.borrow()
    }

    /// Resolves once the message is acked. Never resolves if it is nacked.
    pub async fn acked(&self) {
        self.wait_for(Finalization::Acked).await
    }

    /// Resolves once the message is nacked. Never resolves if it is acked.
    pub async fn nacked(&self) {
        self.wait_for(Finalization::Nacked).await
    }

    async fn wait_for(&self, outcome: Finalization) {
        let mut rx = self.state.subscribe();
        if rx.wait_for(|state| *state == outcome).await.is_err() {
            std::future::pending::<()>().await
        }
    }

    /// Cancellation scope of the message, fired when the subscription stops
    /// while the message is still being processed.
    pub fn context(&self) -> &Signal {
        &self.scope
    }

    /// Trace context propagated by the publisher through the message headers.
    pub fn trace_context(&self) -> &Context {
        &self.trace_context
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Finalization> {
        self.state.subscribe()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .field("finalization", &self.finalization())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message() -> Message {
        Message::new(b"payload".to_vec(), 7, false, Signal::new(), Context::new())
    }

    #[test]
    fn ack_twice_is_a_single_success() {
        let msg = message();

        assert!(msg.ack());
        assert!(msg.ack());
        assert_eq!(msg.finalization(), Finalization::Acked);
    }

    #[test]
    fn nack_after_ack_is_rejected() {
        let msg = message();

        assert!(msg.ack());
        assert!(!msg.nack());
        assert_eq!(msg.finalization(), Finalization::Acked);
    }

    #[test]
    fn ack_after_nack_is_rejected() {
        let msg = message();

        assert!(msg.nack());
        assert!(!msg.ack());
        assert!(msg.nack());
        assert_eq!(msg.finalization(), Finalization::Nacked);
    }

    #[tokio::test]
    async fn observe_finalization() {
        let msg = message();
        let mut watcher = msg.watch();

        msg.nack();

        tokio::time::timeout(Duration::from_secs(1), msg.nacked())
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), msg.acked())
            .await
            .is_err());
        assert_eq!(
            *watcher.wait_for(|s| *s != Finalization::Pending).await.unwrap(),
            Finalization::Nacked
        );
    }

    #[test]
    fn expose_payload_and_scope() {
        let msg = message();

        assert_eq!(msg.payload(), b"payload");
        assert_eq!(msg.delivery_tag(), 7);
        assert!(!msg.redelivered());
        assert!(!msg.context().is_fired());
    }
}
