//! Cooperative cancellation for the polling pipeline.
//!
//! A [`ShutdownTrigger`] is held by whoever owns process lifecycle (the
//! signal handler in the binary, or a test). Every blocking stage of a
//! cycle holds a [`Shutdown`] clone and races its work against
//! [`Shutdown::cancelled`].

use tokio::sync::watch;

/// Sending half: fires the shutdown once.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signals every associated [`Shutdown`] handle.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Creates a linked trigger/handle pair.
    #[must_use]
    pub fn new() -> (ShutdownTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Self { rx })
    }

    /// A handle that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_trigger, shutdown) = Self::new();
        shutdown
    }

    /// Returns true once the trigger has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when the trigger fires. Never completes if the trigger
    /// was dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
