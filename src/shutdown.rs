//! Cooperative cancellation handle shared by workers and batch processors.
//!
//! A `watch` channel carries a single "cancelled" flag. Long-running
//! operations hold a cheap [`Shutdown`] clone and either poll
//! [`Shutdown::is_cancelled`] between steps or `select!` against
//! [`Shutdown::cancelled`] while sleeping.

use tokio::sync::watch;

/// Triggering side. Dropping the handle also counts as cancellation.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Receivers having gone away is fine; nothing left to cancel.
        let _ = self.tx.send(true);
    }
}

/// Observing side, cloneable into every task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is triggered (or the handle is dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// A handle that is never cancelled. Useful for one-shot callers.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_flips_the_flag() {
        let (handle, shutdown) = shutdown_channel();
        assert!(!shutdown.is_cancelled());
        handle.trigger();
        assert!(shutdown.is_cancelled());
        shutdown.cancelled().await; // must not hang
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let (handle, shutdown) = shutdown_channel();
        let waiter = tokio::spawn(async move {
            shutdown.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_counts_as_cancellation() {
        let (handle, shutdown) = shutdown_channel();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("cancelled() should resolve when sender is gone");
    }

    #[tokio::test]
    async fn never_is_not_cancelled() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_cancelled());
    }
}
