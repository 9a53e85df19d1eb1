//! Global cancellation for `apply` and `status` runs.
//!
//! A [`CancelHandle`] flips a `watch` flag; every [`CancelSignal`] cloned from
//! it observes the flip, including ones blocked inside a running command.

use std::sync::Arc;

use tokio::sync::watch;

/// Sending half. Dropping it without calling [`CancelHandle::cancel`] never
/// cancels anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiving half, cheap to clone into spawned tasks.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the handle
    /// is gone without having cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiting_signal() {
        let (handle, mut signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });
        handle.cancel();

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal never fired")
            .expect("join failed");
        assert!(woke);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        let res = tokio::time::timeout(Duration::from_secs(10), signal.cancelled()).await;
        assert!(res.is_err());
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_subscribed_signal_sees_cancel() {
        let (handle, original) = CancelHandle::new();
        let late = handle.signal();
        handle.cancel();
        assert!(original.is_cancelled());
        assert!(late.is_cancelled());
    }
}
