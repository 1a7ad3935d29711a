// letschat-sync: the Broadcaster[T] latest-value publish/subscribe primitive.
//
// Producers (WireLoop readers, SendPipeline) must never block on a slow UI,
// and the UI only ever cares about the freshest state — so `Write` drops
// stale intermediate values by design (latest-wins). Grounded on the
// registry-of-senders shape in rt-ui-log's `UiLogger` and rt-timer's
// `EventBus` (per-key `broadcast::Sender` registry), generalized here to a
// per-subscriber `watch::Sender` so a full channel overwrites rather than
// blocks or drops the write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{watch, Notify};

/// Opaque handle returned by [`Broadcaster::subscribe`], passed back to
/// [`Broadcaster::unsubscribe`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

struct Inner<T> {
    value: RwLock<T>,
    subscribers: Mutex<HashMap<u64, watch::Sender<T>>>,
    next_token: AtomicU64,
    changed: Notify,
}

/// A latest-value multicast primitive. Any number of subscribers may
/// register; each sees only the most recent value as of whenever it last
/// checked (no backlog, no queueing).
pub struct Broadcaster<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Broadcaster<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(initial),
                subscribers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                changed: Notify::new(),
            }),
        }
    }

    /// Store `v` as the current value and wake every subscriber. Never
    /// blocks: a `watch::Sender::send` to a subscriber with a pending
    /// unread value simply overwrites it (latest-wins), and a subscriber
    /// whose receiver has been dropped is pruned lazily on the next write.
    pub fn write(&self, v: T) {
        *self.inner.value.write().unwrap() = v.clone();
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|_, tx| tx.send(v.clone()).is_ok());
        drop(subs);
        self.inner.changed.notify_waiters();
    }

    /// Register a new subscriber. The returned channel's initial value is
    /// whatever is current at subscribe time; it observes every subsequent
    /// `write` unless overtaken by a more recent one.
    pub fn subscribe(&self) -> (Token, watch::Receiver<T>) {
        let current = self.inner.value.read().unwrap().clone();
        let (tx, rx) = watch::channel(current);
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().insert(token, tx);
        (Token(token), rx)
    }

    /// Remove a subscriber. A no-op if the token is unknown (already
    /// pruned, or already unsubscribed).
    pub fn unsubscribe(&self, token: Token) {
        self.inner.subscribers.lock().unwrap().remove(&token.0);
    }

    /// Read the current value without subscribing.
    pub fn get(&self) -> T {
        self.inner.value.read().unwrap().clone()
    }

    /// Block until the next `write` and return the new value. Intended for
    /// a UI loop that wants to redraw on each change rather than stream
    /// every intermediate write.
    pub async fn wait_for_state_change(&self) -> T {
        let notified = self.inner.changed.notified();
        notified.await;
        self.get()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}
