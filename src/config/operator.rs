//! Desired-state configuration stored in the cluster config object

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::images::ImageMapping;
use crate::error::{Error, Result};

/// Namespace holding the cluster-wide install configuration
pub const CLUSTER_CONFIG_NAMESPACE: &str = "kube-system";
/// Name of the ConfigMap holding the cluster-wide install configuration
pub const CLUSTER_CONFIG_NAME: &str = "cluster-config-v1";
/// Key inside the ConfigMap carrying this operator's YAML config
pub const OPERATOR_CONFIG_KEY: &str = "mao-config";

/// Infrastructure provider the cluster runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Libvirt,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Aws => write!(f, "aws"),
            Provider::Libvirt => write!(f, "libvirt"),
        }
    }
}

/// AWS-specific install parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    pub cluster_name: String,
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub region: String,
    pub availability_zone: String,
    /// AMI used for worker machines
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

/// Libvirt-specific install parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibvirtConfig {
    pub uri: String,
    pub network_name: String,
    #[serde(rename = "iprange")]
    pub ip_range: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub cluster_name: String,
}

fn default_replicas() -> i32 {
    1
}

/// Resolved desired state for one sync or bootstrap attempt
///
/// Produced fresh on every resolution and never shared between concurrent
/// consumers. Enrichment consumes the value and returns a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    #[serde(default)]
    pub target_namespace: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libvirt: Option<LibvirtConfig>,
    #[serde(default, skip_serializing_if = "ImageMapping::is_empty")]
    pub images: ImageMapping,
}

impl OperatorConfig {
    /// Parse the operator config out of the cluster config object's data.
    ///
    /// An empty `targetNamespace` defaults to `operator_namespace`.
    pub fn from_cluster_config(
        data: Option<&BTreeMap<String, String>>,
        operator_namespace: &str,
    ) -> Result<Self> {
        let raw = data
            .and_then(|d| d.get(OPERATOR_CONFIG_KEY))
            .ok_or_else(|| Error::MissingConfigField {
                namespace: CLUSTER_CONFIG_NAMESPACE.to_string(),
                name: CLUSTER_CONFIG_NAME.to_string(),
                field: OPERATOR_CONFIG_KEY.to_string(),
            })?;

        let mut config: OperatorConfig = serde_yaml::from_str(raw)?;
        if config.target_namespace.is_empty() {
            config.target_namespace = operator_namespace.to_string();
        }
        Ok(config)
    }

    /// Return a copy of this config carrying `images`
    pub fn with_images(self, images: ImageMapping) -> Self {
        Self { images, ..self }
    }

    /// Name of the cluster being managed, taken from the provider section
    pub fn cluster_name(&self) -> Result<&str> {
        let name = match self.provider {
            Provider::Aws => self.aws()?.cluster_name.as_str(),
            Provider::Libvirt => self.libvirt()?.cluster_name.as_str(),
        };
        if name.is_empty() {
            return Err(Error::ConfigError(format!(
                "{} config has an empty clusterName",
                self.provider
            )));
        }
        Ok(name)
    }

    /// Worker replica count requested by the provider section
    pub fn worker_replicas(&self) -> Result<i32> {
        match self.provider {
            Provider::Aws => Ok(self.aws()?.replicas),
            Provider::Libvirt => Ok(self.libvirt()?.replicas),
        }
    }

    pub fn aws(&self) -> Result<&AwsConfig> {
        self.aws.as_ref().ok_or_else(|| {
            Error::ConfigError("provider is aws but the aws section is missing".to_string())
        })
    }

    pub fn libvirt(&self) -> Result<&LibvirtConfig> {
        self.libvirt.as_ref().ok_or_else(|| {
            Error::ConfigError("provider is libvirt but the libvirt section is missing".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(yaml: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(OPERATOR_CONFIG_KEY.to_string(), yaml.to_string())])
    }

    #[test]
    fn test_missing_field_is_descriptive() {
        let cm = BTreeMap::from([("install-config".to_string(), "{}".to_string())]);
        let err = OperatorConfig::from_cluster_config(Some(&cm), "openshift-machine-api")
            .unwrap_err();
        assert!(matches!(err, Error::MissingConfigField { .. }));
        assert!(err.to_string().contains("mao-config doesn't exist"));

        let err = OperatorConfig::from_cluster_config(None, "openshift-machine-api").unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_empty_target_namespace_defaults_to_operator_namespace() {
        let yaml = r#"
provider: libvirt
libvirt:
  uri: qemu+tcp://192.168.122.1/system
  networkName: actuator
  iprange: 192.168.124.0/24
  replicas: 2
  clusterName: test
"#;
        let config =
            OperatorConfig::from_cluster_config(Some(&data(yaml)), "openshift-machine-api")
                .unwrap();
        assert_eq!(config.target_namespace, "openshift-machine-api");
        assert_eq!(config.provider, Provider::Libvirt);
        assert_eq!(config.libvirt().unwrap().ip_range, "192.168.124.0/24");
        assert_eq!(config.worker_replicas().unwrap(), 2);
        assert!(config.images.is_empty());
    }

    #[test]
    fn test_explicit_target_namespace_is_kept() {
        let yaml = r#"
targetNamespace: machine-api
provider: aws
aws:
  clusterName: meh
  clusterID: 4a5f-11e8
  region: us-east-1
  availabilityZone: us-east-1a
  image: ami-0af8953af3ec06b7c
"#;
        let config =
            OperatorConfig::from_cluster_config(Some(&data(yaml)), "openshift-machine-api")
                .unwrap();
        assert_eq!(config.target_namespace, "machine-api");
        assert_eq!(config.cluster_name().unwrap(), "meh");
        assert_eq!(config.aws().unwrap().cluster_id, "4a5f-11e8");
        assert_eq!(config.worker_replicas().unwrap(), 1);
    }

    #[test]
    fn test_unknown_provider_fails_to_parse() {
        let err = OperatorConfig::from_cluster_config(
            Some(&data("provider: openstack\n")),
            "openshift-machine-api",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParseError(_)));
        assert!(err.to_string().starts_with("failed unmarshalling config"));
    }

    #[test]
    fn test_missing_provider_section() {
        let config = OperatorConfig::from_cluster_config(
            Some(&data("provider: aws\n")),
            "openshift-machine-api",
        )
        .unwrap();
        assert!(config.cluster_name().is_err());
        assert!(config.worker_replicas().is_err());
    }
}
