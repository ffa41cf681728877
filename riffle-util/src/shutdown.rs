//! A single root shutdown signal, owned by the supervisor and cloned into
//! every task it spawns.
//!
//! The sender side broadcasts the signal and then waits for every receiver
//! to be dropped, which gives the caller a natural "all tasks exited"
//! rendezvous. Receivers are cheap to clone and are usually polled inside a
//! `tokio::select!` arm next to the task's main work.

use std::future::Future;

use tokio::sync::watch;

/// Create a connected shutdown sender/receiver pair.
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownReceiver { rx })
}

/// The sending half of a shutdown signal. There is exactly one per
/// supervisor.
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Broadcast the shutdown signal and wait until every
    /// [`ShutdownReceiver`] has been dropped.
    pub async fn shutdown(self) {
        // Send errors just mean every receiver is already gone.
        let _ = self.tx.send(true);
        self.tx.closed().await;
    }

    /// Broadcast the shutdown signal without waiting for receivers.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    /// A new receiver subscribed to this sender.
    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// The receiving half of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    /// Resolve once the shutdown signal has been broadcast. If the sender is
    /// dropped without signalling, this also resolves, since no further work
    /// can be coordinated.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the signal has already been broadcast.
    pub fn signal_received(&self) -> bool {
        *self.rx.borrow()
    }

    /// Run `fut` to completion unless the shutdown signal arrives first.
    /// Returns `None` if shutdown won the race.
    pub async fn run_until<F, T>(&mut self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.recv() => None,
            out = fut => Some(out),
        }
    }
}
