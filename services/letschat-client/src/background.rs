use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Structured-concurrency supervisor. Every long-lived task is spawned
/// through [`BackgroundTasks::run`], which hands it a clone of the
/// shutdown receiver as its first argument; the task must return promptly
/// once that receiver observes `true`. Uses the same
/// `watch::Receiver<bool>` shutdown signal already threaded through
/// `wire::run_wire_loop`.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// A fresh clone of the shutdown signal, for callers that need to watch
    /// it without going through `run`.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// A clone of the shutdown sender, for an external trigger (e.g. a
    /// Ctrl-C handler) that needs to fire the signal without also blocking
    /// on `wait`.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Spawns `f(shutdown_rx)`, counting it active until it returns.
    pub fn run<F, Fut>(&self, f: F) -> JoinHandle<()>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        let idle = self.idle.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            f(shutdown_rx).await;
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Blocks until every spawned task has returned.
    pub async fn wait(&self) {
        loop {
            // `Notified` doesn't register itself as a waiter until it's
            // polled, so pin it and call `enable()` before checking the
            // count below — otherwise a task finishing between the check
            // and the `.await` notifies nobody and `wait` hangs forever.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Signals shutdown to every task and waits for them all to return.
    pub async fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wait().await;
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
