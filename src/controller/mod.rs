//! Controller module for the machine-api-operator
//!
//! Watches a fixed set of collections, funnels every change into a single
//! reconciliation key and drives the sync pipeline from a worker pool. A
//! bootstrap loop runs alongside to create the initial cluster topology.

pub mod bootstrap;
pub mod client;
pub mod conditions;
#[cfg(test)]
mod fake;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod policy;
pub mod queue;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod status;
pub mod watch;
mod worker;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ConfigResolver;
use crate::error::{Error, Result};

pub use bootstrap::{BootstrapLoop, BootstrapOutcome, BootstrapState};
pub use client::{ApplyOutcome, ClusterApi, KubeClusterApi, ManagedObject};
pub use policy::{Disposition, ErrorPolicy, ErrorReporter, MAX_RETRIES};
pub use queue::{ExponentialFailureRateLimiter, RateLimiter, RateLimitingQueue};
pub use reconciler::{Reconciler, Stage, SyncHandler};
pub use status::{StatusSnapshot, StatusTracker};
pub use watch::{spawn_watchers, CacheSync, EnqueueDispatcher, ResourceEventHandler, ResourceRef};
pub use worker::WorkerPool;

/// Name of the operator's work queue
pub const QUEUE_NAME: &str = "machineapioperator";

/// The single `namespace/name` key every change notification maps to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    namespace: String,
    name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Immutable process settings
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Namespace the operator runs in; default target namespace
    pub namespace: String,
    pub name: String,
    /// Path of the JSON image manifest
    pub images_file: PathBuf,
    pub bootstrap_interval: Duration,
    pub bootstrap_timeout: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: "openshift-machine-api".to_string(),
            name: "machine-api-operator".to_string(),
            images_file: PathBuf::from("/etc/machine-api-operator/images.json"),
            bootstrap_interval: bootstrap::DEFAULT_POLL_INTERVAL,
            bootstrap_timeout: bootstrap::DEFAULT_TIMEOUT,
        }
    }
}

/// Wires queue, pipeline, policy and bootstrap loop together
pub struct Operator {
    settings: OperatorSettings,
    api: Arc<dyn ClusterApi>,
    queue: RateLimitingQueue<ReconcileKey>,
    status: Arc<StatusTracker>,
    reporter: Arc<ErrorReporter>,
}

impl Operator {
    pub fn new(api: Arc<dyn ClusterApi>, settings: OperatorSettings) -> Self {
        Self {
            settings,
            api,
            queue: RateLimitingQueue::with_default_limiter(QUEUE_NAME),
            status: Arc::new(StatusTracker::new()),
            reporter: Arc::new(ErrorReporter::default()),
        }
    }

    pub fn key(&self) -> ReconcileKey {
        ReconcileKey::new(&self.settings.namespace, &self.settings.name)
    }

    /// Change handler to register with every watched collection
    pub fn event_handler(&self) -> Arc<EnqueueDispatcher> {
        Arc::new(EnqueueDispatcher::new(self.queue.clone(), self.key()))
    }

    pub fn status(&self) -> Arc<StatusTracker> {
        self.status.clone()
    }

    pub fn reporter(&self) -> Arc<ErrorReporter> {
        self.reporter.clone()
    }

    pub fn queue(&self) -> &RateLimitingQueue<ReconcileKey> {
        &self.queue
    }

    fn resolver(&self) -> ConfigResolver {
        ConfigResolver::new(
            self.api.clone(),
            &self.settings.namespace,
            &self.settings.images_file,
        )
    }

    /// Run until `token` fires or bootstrap fails.
    ///
    /// Returns an error if the caches never sync or the bootstrap loop fails;
    /// the caller decides whether that ends the process.
    pub async fn run(
        &self,
        workers: usize,
        caches: CacheSync,
        token: CancellationToken,
    ) -> Result<()> {
        info!("Starting MachineAPIOperator");

        if let Err(e) = caches.wait(&token).await {
            error!("failed to sync caches");
            self.queue.shut_down();
            return Err(e);
        }
        self.status.set_caches_synced();
        info!("Synched up caches");

        let bootstrap = BootstrapLoop::new(self.api.clone(), self.resolver(), self.status.clone())
            .with_interval(self.settings.bootstrap_interval)
            .with_timeout(self.settings.bootstrap_timeout);
        let bootstrap_token = token.child_token();
        let mut bootstrap = tokio::spawn(async move { bootstrap.run(bootstrap_token).await });

        let reconciler = Arc::new(Reconciler::new(self.api.clone(), self.resolver()));
        let policy = ErrorPolicy::new(
            self.queue.clone(),
            self.reporter.clone(),
            self.status.clone(),
        );
        let pool = WorkerPool::new(self.queue.clone(), reconciler, policy);
        let workers_done = pool.run(workers, token.clone());
        tokio::pin!(workers_done);

        let bootstrap_result = tokio::select! {
            _ = &mut workers_done => {
                // stop signal already fired; the child token ends the loop too
                let _ = bootstrap.await;
                info!("Shutting down MachineAPIOperator");
                return Ok(());
            }
            res = &mut bootstrap => res,
        };

        let result = match bootstrap_result {
            Ok(Ok(BootstrapOutcome::Converged { ticks })) => {
                info!(ticks, "Bootstrap objects created");
                Ok(())
            }
            Ok(Ok(BootstrapOutcome::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::TaskFailed(format!("bootstrap loop: {e}"))),
        };
        if let Err(e) = &result {
            error!("Error out while trying to deploy machines: {}", e);
            token.cancel();
        }

        workers_done.await;
        info!("Shutting down MachineAPIOperator");
        result
    }
}
