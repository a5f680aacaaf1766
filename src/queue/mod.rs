//! Deduplicating, rate-limited work queue of PVC keys
//!
//! A key is held at most once in the queue and handed to at most one worker
//! at a time. A key re-added while a worker holds it is parked as dirty and
//! queued again when the worker calls [`WorkQueue::done`].

mod rate_limiter;

pub use rate_limiter::{ItemExponentialRateLimiter, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    ready: Notify,
    rate_limiter: ItemExponentialRateLimiter,
    shutdown: CancellationToken,
}

/// Work queue shared by the change feed and the worker pool
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Create a queue with the default per-item backoff
    pub fn new(name: &'static str) -> Self {
        Self::with_rate_limiter(name, ItemExponentialRateLimiter::default())
    }

    pub fn with_rate_limiter(name: &'static str, rate_limiter: ItemExponentialRateLimiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State::default()),
                ready: Notify::new(),
                rate_limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.ready.notify_one();
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Queue `key` after its current backoff and grow the backoff.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.inner.rate_limiter.when(&key);
        debug!(queue = self.inner.name, key = %key, ?delay, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.rate_limiter.forget(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// Every key returned must be passed to [`WorkQueue::done`] exactly once.
    pub async fn get(&self) -> Option<String> {
        loop {
            let ready = self.inner.ready.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            ready.await;
        }
    }

    /// Mark `key` as no longer being processed.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.ready.notify_one();
        }
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stop handing out keys and wake every blocked [`WorkQueue::get`].
    ///
    /// Keys already handed out stay valid; workers finish them and call
    /// `done` as usual. Keys still queued are never handed out; the relist
    /// after a restart enqueues every object again.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
        debug!(queue = self.inner.name, "queue shut down");
    }
}
