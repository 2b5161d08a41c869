//! Rate-limited, deduplicating work queue of Pod keys.
//!
//! Semantics:
//! - adding a key that is already waiting is a no-op;
//! - a key handed to a worker is not re-queued until `done` is called for
//!   it, so no two workers ever process the same key concurrently;
//! - `retry` re-adds a key after an exponential backoff and tracks the
//!   per-key retry count until `forget` clears it.
//!
//! After `shutdown` the waiting side drains: `take` keeps returning queued
//! keys until the queue is empty, then yields `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    // keys waiting or currently queued; membership here dedups adds
    dirty: HashSet<String>,
    // keys handed to a worker and not yet done
    processing: HashSet<String>,
    retries: HashMap<String, u32>,
    shut_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// `base_delay` is the first retry backoff; each further retry doubles
    /// it up to `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn add(&self, key: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        // a key being processed stays dirty and is re-queued on done()
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Next key to process, or `None` once the queue is shut down and empty.
    pub async fn take(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking state, so a notification issued
            // between the check and the await is not lost
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a re-add that arrived while it was being
    /// processed puts it back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Schedule a re-add of `key` after the next backoff step.
    pub fn retry(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            let attempts = state.retries.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            let exp = attempts.saturating_sub(1).min(31);
            self.inner
                .base_delay
                .saturating_mul(1u32 << exp)
                .min(self.inner.max_delay)
        };
        debug!("retrying {key} in {delay:?}");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Retries recorded for `key` since it was last forgotten.
    pub fn num_retries(&self, key: &str) -> u32 {
        *self
            .inner
            .state
            .lock()
            .unwrap()
            .retries
            .get(key)
            .unwrap_or(&0)
    }

    /// Clear the retry count so the next failure starts the backoff over.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().unwrap().retries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.inner.state.lock().unwrap().shut_down = true;
        self.inner.notify.notify_waiters();
    }
}
