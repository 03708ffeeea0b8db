//! Cooperative shutdown (SUPP-3, spec §5 "stoppable pause").
//!
//! Every background task -- the accept loop, the registration backoff, the
//! RAM sampler, an in-flight rebalance -- needs to notice a shutdown request
//! promptly (within ≤500ms) without polling a flag in a tight loop. A
//! `tokio::sync::watch` channel gives every task a cheap, clonable handle to
//! `select!` against their normal sleep/accept future.

use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// Signals every clone of the matching [`Shutdown`] to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves as soon as shutdown is triggered.
    pub async fn wait(&mut self) {
        if self.is_triggered() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    /// Sleeps for `duration`, waking early if shutdown is triggered first.
    /// Returns `true` if the sleep completed normally, `false` if cut short
    /// by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_is_interrupted_by_trigger() {
        let (handle, mut shutdown) = ShutdownHandle::new();

        let waiter = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();

        let completed_normally = waiter.await.unwrap();
        assert!(!completed_normally);
    }

    #[tokio::test]
    async fn clones_all_observe_the_same_trigger() {
        let (handle, shutdown) = ShutdownHandle::new();
        let other = shutdown.clone();

        assert!(!shutdown.is_triggered());
        assert!(!other.is_triggered());

        handle.trigger();

        assert!(shutdown.is_triggered());
        assert!(other.is_triggered());
    }
}
