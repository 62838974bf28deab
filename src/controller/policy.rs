//! Classification of sync outcomes into forget, retry or drop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error};

use super::queue::RateLimitingQueue;
use super::status::StatusTracker;
use super::ReconcileKey;
use crate::error::{Error, Result};

/// Number of consecutive failures after which a key is dropped.
///
/// With the default limiter the requeue delays run
/// 5ms, 10ms, 20ms, ... 41s before the key is given up on.
pub const MAX_RETRIES: u32 = 15;

/// What the policy did with a key after a sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Sync succeeded; backoff history cleared
    Forgotten,
    /// Sync failed; key re-added after the returned delay
    Requeued(Duration),
    /// Retries exhausted; error reported and backoff history cleared
    Dropped,
}

/// Process-wide sink for errors that are no longer retried
#[derive(Debug, Default)]
pub struct ErrorReporter {
    reported: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ErrorReporter {
    pub fn report(&self, err: &Error) {
        error!(error = %err, kind = err.kind(), "Unhandled error");
        self.reported.fetch_add(1, Ordering::Relaxed);
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    /// Total number of errors reported since start
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Decides what happens to a key once its sync has returned
#[derive(Clone)]
pub struct ErrorPolicy {
    queue: RateLimitingQueue<ReconcileKey>,
    reporter: Arc<ErrorReporter>,
    status: Arc<StatusTracker>,
    max_retries: u32,
}

impl ErrorPolicy {
    pub fn new(
        queue: RateLimitingQueue<ReconcileKey>,
        reporter: Arc<ErrorReporter>,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            queue,
            reporter,
            status,
            max_retries: MAX_RETRIES,
        }
    }

    pub fn handle(&self, result: Result<()>, key: &ReconcileKey) -> Disposition {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                self.status.sync_succeeded();
                return Disposition::Forgotten;
            }
            Err(err) => err,
        };

        if self.queue.num_requeues(key) < self.max_retries {
            debug!("Error syncing operator {}: {}", key, err);
            self.status.sync_failed(&err);
            let delay = self.queue.add_rate_limited(key.clone());
            return Disposition::Requeued(delay);
        }

        self.reporter.report(&err);
        #[cfg(feature = "metrics")]
        super::metrics::inc_drop(self.queue.name());
        debug!("Dropping operator {:?} out of the queue: {}", key.to_string(), err);
        self.status.sync_abandoned(&err);
        self.queue.forget(key);
        Disposition::Dropped
    }
}
