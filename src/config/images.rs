//! Component image mapping loaded from the on-disk image manifest

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Aggregated Cluster API server
pub const CLUSTER_API_SERVER: &str = "clusterAPIServer";
/// Provider-independent Cluster API controller manager
pub const CLUSTER_API_CONTROLLER_MANAGER: &str = "clusterAPIControllerManager";
/// Machine controller for AWS
pub const CLUSTER_API_CONTROLLER_AWS: &str = "clusterAPIControllerAWS";
/// Machine controller for libvirt
pub const CLUSTER_API_CONTROLLER_LIBVIRT: &str = "clusterAPIControllerLibvirt";

/// Component name to image reference table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageMapping(BTreeMap<String, String>);

impl ImageMapping {
    /// Read and parse the manifest at `path`.
    ///
    /// Called on every sync; the result is never cached so an upgraded
    /// manifest takes effect on the next reconcile.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| Error::ImageManifestRead {
                path: path.to_path_buf(),
                source,
            })?;
        let images: ImageMapping =
            serde_json::from_slice(&raw).map_err(|source| Error::ImageManifestParse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), components = images.0.len(), "Loaded image manifest");
        Ok(images)
    }

    /// Look up the image for `component`, failing if it is absent or blank
    pub fn require(&self, component: &str) -> Result<&str> {
        self.0
            .get(component)
            .map(String::as_str)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| Error::MissingImage(component.to_string()))
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.0.get(component).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ImageMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
