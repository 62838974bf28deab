//! Sync pipeline for the operator's single reconciliation key
//!
//! A sync runs six stages in order and stops at the first failure. Every
//! stage is idempotent, so a failed sync is repaired by running it again.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, trace};

use super::client::{ApplyOutcome, ClusterApi, ManagedObject};
use super::resources;
use super::ReconcileKey;
use crate::config::{ConfigResolver, OperatorConfig};
use crate::crd::cluster_api_crds;
use crate::error::{Error, Result};

/// Pipeline stages, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    RegisterCrds,
    ResolveConfig,
    ResolveImages,
    ClusterApiServer,
    ClusterApiController,
    SyncAll,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::RegisterCrds,
        Stage::ResolveConfig,
        Stage::ResolveImages,
        Stage::ClusterApiServer,
        Stage::ClusterApiController,
        Stage::SyncAll,
    ];

    /// Stable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RegisterCrds => "register_crds",
            Stage::ResolveConfig => "resolve_config",
            Stage::ResolveImages => "resolve_images",
            Stage::ClusterApiServer => "cluster_api_server",
            Stage::ClusterApiController => "cluster_api_controller",
            Stage::SyncAll => "sync_all",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::RegisterCrds => "CRD registration",
            Stage::ResolveConfig => "operator config resolution",
            Stage::ResolveImages => "image resolution",
            Stage::ClusterApiServer => "cluster API server convergence",
            Stage::ClusterApiController => "cluster API controller convergence",
            Stage::SyncAll => "managed resource convergence",
        };
        f.write_str(s)
    }
}

/// Something the worker pool can hand a key to
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &ReconcileKey) -> Result<()>;
}

/// Runs the sync pipeline against a [`ClusterApi`]
pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    resolver: ConfigResolver,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ClusterApi>, resolver: ConfigResolver) -> Self {
        Self { api, resolver }
    }

    async fn run_stages(&self) -> Result<()> {
        self.sync_custom_resource_definitions()
            .await
            .map_err(|e| e.in_stage(Stage::RegisterCrds))?;

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

        self.sync_cluster_api_server(&config)
            .await
            .map_err(|e| e.in_stage(Stage::ClusterApiServer))?;
        info!("Synched up cluster api server");

        self.sync_cluster_api_controller(&config)
            .await
            .map_err(|e| e.in_stage(Stage::ClusterApiController))?;
        info!("Synched up cluster api controller");

        self.sync_all(&config)
            .await
            .map_err(|e| e.in_stage(Stage::SyncAll))
    }

    async fn sync_custom_resource_definitions(&self) -> Result<()> {
        for crd in cluster_api_crds() {
            if self.api.ensure_crd(&crd).await? == ApplyOutcome::Created {
                info!(
                    "Created CRD {}",
                    crd.metadata.name.as_deref().unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    async fn sync_cluster_api_server(&self, config: &OperatorConfig) -> Result<()> {
        self.apply_all(resources::cluster_api_server_objects(config)?)
            .await
    }

    async fn sync_cluster_api_controller(&self, config: &OperatorConfig) -> Result<()> {
        self.apply_all(resources::cluster_api_controller_objects(config)?)
            .await
    }

    async fn sync_all(&self, config: &OperatorConfig) -> Result<()> {
        self.apply_all(resources::rbac_objects(config)).await
    }

    async fn apply_all(&self, objects: Vec<ManagedObject>) -> Result<()> {
        for object in objects {
            match self.api.apply(&object).await? {
                ApplyOutcome::Unchanged => {
                    debug!("{} {} unchanged", object.kind(), object.name())
                }
                outcome => info!("{} {} {:?}", object.kind(), object.name(), outcome),
            }
        }
        Ok(())
    }
}

fn failed_stage(err: &Error) -> Option<Stage> {
    match err {
        Error::StageFailed { stage, .. } => Some(*stage),
        _ => None,
    }
}

#[async_trait]
impl SyncHandler for Reconciler {
    #[instrument(skip(self), fields(key = %key))]
    async fn sync(&self, key: &ReconcileKey) -> Result<()> {
        let start = Instant::now();
        trace!("Started syncing operator {:?}", key.to_string());

        let result = self.run_stages().await;

        let elapsed = start.elapsed();
        trace!("Finished syncing operator {:?} ({:?})", key.to_string(), elapsed);

        #[cfg(feature = "metrics")]
        {
            super::metrics::observe_sync_duration_seconds(result.is_ok(), elapsed.as_secs_f64());
            if let Err(e) = &result {
                let stage = failed_stage(e).map_or("unknown", |s| s.as_str());
                super::metrics::inc_sync_error(stage, e.kind());
            }
        }
        if let Err(e) = &result {
            debug!(stage = ?failed_stage(e), "Sync failed: {}", e);
        }
        result
    }
}
