//! Error types for the machine-api-operator

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::controller::Stage;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The cluster config object exists but lacks the operator's field
    #[error("{field} doesn't exist in configmap {namespace}/{name}")]
    MissingConfigField {
        namespace: String,
        name: String,
        field: String,
    },

    /// The operator's config field could not be parsed
    #[error("failed unmarshalling config: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// The image manifest file could not be read
    #[error("failed to read image manifest {}: {source}", path.display())]
    ImageManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image manifest file is not valid JSON
    #[error("failed to parse image manifest {}: {source}", path.display())]
    ImageManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A component required by a stage has no image entry
    #[error("no image configured for component {0}")]
    MissingImage(String),

    /// A sync pipeline stage failed
    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    /// The sync handler panicked; the panic was contained by the worker
    #[error("sync panicked: {0}")]
    SyncPanicked(String),

    /// Bootstrap objects were not created before the deadline
    #[error("timed out after {0:?} waiting for the Cluster and MachineSet objects")]
    BootstrapTimeout(Duration),

    /// A background task ended abnormally
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// The stop signal fired before the watch caches finished their initial list
    #[error("failed to sync caches")]
    CacheSyncFailed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Wrap this error with the identity of the pipeline stage that produced it
    pub fn in_stage(self, stage: Stage) -> Self {
        Error::StageFailed {
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any stage context
    #[cfg(test)]
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_)
            | Error::MissingConfigField { .. }
            | Error::ConfigParseError(_) => "config",
            Error::ImageManifestRead { .. }
            | Error::ImageManifestParse { .. }
            | Error::MissingImage(_) => "images",
            Error::StageFailed { source, .. } => source.kind(),
            Error::SyncPanicked(_) => "panic",
            Error::BootstrapTimeout(_) => "bootstrap_timeout",
            Error::TaskFailed(_) => "task",
            Error::CacheSyncFailed => "cache_sync",
            Error::SerializationError(_) => "serialization",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_cause() {
        let err = Error::MissingImage("clusterAPIServer".to_string())
            .in_stage(Stage::ClusterApiServer);

        assert!(err.to_string().starts_with("cluster API server convergence failed"));
        assert!(matches!(err.root_cause(), Error::MissingImage(c) if c == "clusterAPIServer"));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("no image configured for component clusterAPIServer")
        );
    }

    #[test]
    fn test_kind_labels() {
        let err = Error::MissingConfigField {
            namespace: "kube-system".into(),
            name: "cluster-config-v1".into(),
            field: "mao-config".into(),
        };
        assert_eq!(err.kind(), "config");
        assert_eq!(err.in_stage(Stage::ResolveConfig).kind(), "config");
    }
}
