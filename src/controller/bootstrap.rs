//! Bootstrap convergence loop
//!
//! Creates the Cluster and then the worker MachineSet, polling until both
//! exist or the deadline passes. Creation failures are retried on the next
//! tick; a config failure ends the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::client::ClusterApi;
use super::reconciler::Stage;
use super::resources::{build_cluster, build_machine_set};
use super::status::StatusTracker;
use crate::config::{ConfigResolver, OperatorConfig};
use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Milestones reached during one run of the loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BootstrapState {
    pub cluster_created: bool,
    pub machine_set_created: bool,
}

impl BootstrapState {
    pub fn is_complete(&self) -> bool {
        self.cluster_created && self.machine_set_created
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Both objects exist; `ticks` attempts were made
    Converged { ticks: u32 },
    /// The stop signal fired first
    Cancelled,
}

pub struct BootstrapLoop {
    api: Arc<dyn ClusterApi>,
    resolver: ConfigResolver,
    status: Arc<StatusTracker>,
    interval: Duration,
    timeout: Duration,
}

impl BootstrapLoop {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        resolver: ConfigResolver,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            api,
            resolver,
            status,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until both objects exist, the deadline passes or `token` fires.
    ///
    /// The first attempt happens one interval after the call.
    #[instrument(skip_all, fields(interval = ?self.interval, timeout = ?self.timeout))]
    pub async fn run(&self, token: CancellationToken) -> Result<BootstrapOutcome> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = BootstrapState::default();
        let mut ticks = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Bootstrap loop stopped before convergence");
                    return Ok(BootstrapOutcome::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Err(Error::BootstrapTimeout(self.timeout));
                }
                _ = ticker.tick() => {}
            }

            ticks += 1;
            // a stalled API call must not outlive the deadline or the stop signal
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Bootstrap loop stopped during an attempt");
                    return Ok(BootstrapOutcome::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Err(Error::BootstrapTimeout(self.timeout));
                }
                res = self.attempt(&mut state) => res,
            };
            attempt?;
            if state.is_complete() {
                self.status.set_bootstrap_complete();
                return Ok(BootstrapOutcome::Converged { ticks });
            }
        }
    }

    async fn resolve(&self) -> Result<OperatorConfig> {
        let config = self
            .resolver
            .operator_config()
            .await
            .map_err(|e| e.in_stage(Stage::ResolveConfig))?;
        let config = self
            .resolver
            .with_images(config)
            .await
            .map_err(|e| e.in_stage(Stage::ResolveImages))?;
        debug!(images = ?config.images, "Resolved bootstrap config");
        Ok(config)
    }

    /// One tick. `Err` only for failures that retrying cannot fix.
    async fn attempt(&self, state: &mut BootstrapState) -> Result<()> {
        let config = self.resolve().await?;

        if !state.cluster_created {
            info!("Trying to deploy Cluster object");
            let cluster = build_cluster(&config)?;
            let created = self.api.create_cluster(&cluster).await;
            #[cfg(feature = "metrics")]
            super::metrics::inc_bootstrap_attempt("cluster", created.is_ok());
            if let Err(e) = created {
                info!("Cannot create cluster, retrying: {}", e);
                return Ok(());
            }
            info!("Created Cluster object");
            state.cluster_created = true;
        }

        if !state.machine_set_created {
            info!("Trying to deploy MachineSet object");
            let machine_set = build_machine_set(&config)?;
            let created = self.api.create_machine_set(&machine_set).await;
            #[cfg(feature = "metrics")]
            super::metrics::inc_bootstrap_attempt("machineset", created.is_ok());
            if let Err(e) = created {
                info!("Cannot create MachineSet, retrying: {}", e);
                return Ok(());
            }
            info!("Created MachineSet object Successfully");
            state.machine_set_created = true;
        }

        Ok(())
    }
}
