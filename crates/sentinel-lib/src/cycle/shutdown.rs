//! Cooperative shutdown
//!
//! A stop request is a one-way latch: the first request flips it, later
//! requests change nothing. The detection loop polls it between stages and
//! races it against its sleeps.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Create a connected shutdown handle and signal
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Requests a stop; cheap to clone into signal handlers
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Request a stop, returning whether this was the first request
    pub fn request(&self, reason: &str) -> bool {
        let first = self.tx.send_if_modified(|stop| {
            if *stop {
                false
            } else {
                *stop = true;
                true
            }
        });
        if first {
            info!(reason = %reason, "Stop requested");
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes stop requests
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested
    ///
    /// Never resolves if every handle is dropped without requesting one.
    pub async fn requested(&mut self) {
        let closed = self.rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless a stop arrives first
    ///
    /// Returns `true` if the sleep was cut short by a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.requested() => true,
        }
    }
}
