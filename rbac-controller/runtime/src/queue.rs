use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, time};

const BASE_DELAY: time::Duration = time::Duration::from_millis(5);
const MAX_DELAY: time::Duration = time::Duration::from_secs(5 * 60);

/// A deduplicating queue of object keys.
///
/// A key is handed to at most one worker at a time. Adding a key that is
/// already waiting is a no-op; adding a key that is being processed marks it
/// dirty so it is queued again once the worker calls [`WorkQueue::done`].
#[derive(Clone, Debug)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    base_delay: time::Duration,
    max_delay: time::Duration,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need processing, whether waiting in `queue` or held back
    /// until an in-flight worker finishes.
    dirty: AHashSet<String>,
    processing: AHashSet<String>,
    failures: AHashMap<String, u32>,
    shutting_down: bool,
}

// === impl WorkQueue ===

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

impl WorkQueue {
    pub fn new(base_delay: time::Duration, max_delay: time::Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds the key once `delay` has elapsed.
    pub fn add_after(&self, key: impl Into<String>, delay: time::Duration) {
        let key = key.into();
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds the key after an exponential backoff determined by the number of
    /// times it has failed since it was last forgotten.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            self.backoff(*failures)
        };
        tracing::debug!(%key, ?delay, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clears the key's failure history.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    drop(state);
                    // Pass the wakeup along to the next waiting worker.
                    self.inner.notify.notify_one();
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks the key as no longer being processed, queueing it again if it was
    /// added in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// The number of keys waiting to be handed to a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(&self, failures: u32) -> time::Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.inner
            .base_delay
            .saturating_mul(1 << exp)
            .min(self.inner.max_delay)
    }
}
