// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Fire-once gates shared between tasks.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable one-shot gate. Once fired it stays fired; every clone observes
/// the same state and every pending [`Signal::wait`] resolves.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Signal { tx: Arc::new(tx) }
    }

    /// Fires the gate. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                return false;
            }
            *fired = true;
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the gate has fired, immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
