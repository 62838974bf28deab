//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the controller work queue contract:
//! - a key added several times before it is taken is delivered once
//! - a key taken by a worker is not handed to another worker until `done`
//! - a key re-added while being processed is queued again on `done`
//! - failed keys are re-added after a per-key exponential backoff

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Base delay of the default per-key backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Ceiling of the default per-key backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Decides how long a failing key waits before it is retried
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return the delay before its next attempt
    fn when(&self, key: &K) -> Duration;
    /// Reset the failure history of `key`
    fn forget(&self, key: &K);
    /// Number of failures recorded for `key` since the last `forget`
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^(n-1)` after the n-th consecutive failure, capped at `max`
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for ExponentialFailureRateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K> RateLimiter<K> for ExponentialFailureRateLimiter<K>
where
    K: Eq + Hash + Clone + Send,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing, whether queued or waiting for `done`
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    /// Fired by `shut_down`; ends pending delayed adds
    stopped: CancellationToken,
}

/// Work queue shared between event sources and workers
///
/// Cloning is cheap; all clones refer to the same queue.
pub struct RateLimitingQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Queue using the default 5ms exponential backoff
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(ExponentialFailureRateLimiter::default()))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` unless it is already pending
    pub fn add(&self, key: K) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // picked up again when the current holder calls done()
                return;
            }
            trace!(queue = %self.inner.name, key = ?key, "Queued key");
            state.queue.push_back(key);
            #[cfg(feature = "metrics")]
            super::metrics::set_queue_depth(&self.inner.name, state.queue.len());
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    #[cfg(feature = "metrics")]
                    super::metrics::set_queue_depth(&self.inner.name, state.queue.len());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` after `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let stopped = self.inner.stopped.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Add `key` after its backoff delay, returning the delay used.
    ///
    /// A no-op returning zero once the queue is shutting down.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        if self.is_shutting_down() {
            trace!(queue = %self.inner.name, key = ?key, "Queue shutting down, not requeueing");
            return Duration::ZERO;
        }
        let delay = self.inner.limiter.when(&key);
        #[cfg(feature = "metrics")]
        super::metrics::inc_requeue(&self.inner.name);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff history of `key`
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Stop handing out keys; blocked and future `get` calls return `None`
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.stopped.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be taken
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
