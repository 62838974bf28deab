//! Resolution of the effective OperatorConfig
//!
//! Shared by the sync pipeline and the bootstrap loop. Each caller resolves
//! its own snapshot; nothing is cached between calls.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::images::ImageMapping;
use super::operator::{OperatorConfig, CLUSTER_CONFIG_NAME, CLUSTER_CONFIG_NAMESPACE};
use crate::controller::client::ClusterApi;
use crate::error::{Error, Result};

/// Fetches the cluster config object and the image manifest
#[derive(Clone)]
pub struct ConfigResolver {
    api: Arc<dyn ClusterApi>,
    operator_namespace: String,
    images_file: PathBuf,
}

impl ConfigResolver {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        operator_namespace: impl Into<String>,
        images_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            operator_namespace: operator_namespace.into(),
            images_file: images_file.into(),
        }
    }

    /// Read `kube-system/cluster-config-v1` and parse the operator's field
    pub async fn operator_config(&self) -> Result<OperatorConfig> {
        info!("Getting operator config using kubeclient");
        let cm = self
            .api
            .get_config_map(CLUSTER_CONFIG_NAMESPACE, CLUSTER_CONFIG_NAME)
            .await?
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "could not find configmap {CLUSTER_CONFIG_NAMESPACE}/{CLUSTER_CONFIG_NAME}"
                ))
            })?;
        OperatorConfig::from_cluster_config(cm.data.as_ref(), &self.operator_namespace)
    }

    /// Attach the current image manifest to `config`
    pub async fn with_images(&self, config: OperatorConfig) -> Result<OperatorConfig> {
        let images = ImageMapping::load(&self.images_file).await?;
        debug!(images = ?images, "Resolved component images");
        Ok(config.with_images(images))
    }
}
