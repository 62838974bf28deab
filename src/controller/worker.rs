//! Worker pool draining the reconciliation queue

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::policy::ErrorPolicy;
use super::queue::RateLimitingQueue;
use super::reconciler::SyncHandler;
use super::ReconcileKey;
use crate::error::Error;

#[derive(Clone)]
pub struct WorkerPool {
    queue: RateLimitingQueue<ReconcileKey>,
    handler: Arc<dyn SyncHandler>,
    policy: ErrorPolicy,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl WorkerPool {
    pub fn new(
        queue: RateLimitingQueue<ReconcileKey>,
        handler: Arc<dyn SyncHandler>,
        policy: ErrorPolicy,
    ) -> Self {
        Self {
            queue,
            handler,
            policy,
        }
    }

    /// Run `workers` pull loops until `token` fires.
    ///
    /// On stop the queue is shut down, so idle workers return at once and
    /// busy ones return after finishing their current key.
    pub async fn run(&self, workers: usize, token: CancellationToken) {
        let mut set = JoinSet::new();
        for id in 0..workers {
            let pool = self.clone();
            set.spawn(async move {
                debug!(worker = id, "Worker started");
                while pool.process_next_work_item().await {}
                debug!(worker = id, "Worker stopped");
            });
        }

        token.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down();

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!("Worker task failed: {}", e);
            }
        }
    }

    /// Take one key and sync it. Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(self.handler.sync(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(key = %key, "Sync panicked: {}", message);
                Err(Error::SyncPanicked(message))
            });

        self.policy.handle(result, &key);
        self.queue.done(&key);
        true
    }
}
