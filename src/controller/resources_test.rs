//! Unit tests for the Cluster API resource builders.
//!
//! Run with: `cargo test -p machine-api-operator resources_test`

#[cfg(test)]
mod tests {
    use crate::config::images::{CLUSTER_API_CONTROLLER_LIBVIRT, CLUSTER_API_SERVER};
    use crate::config::{AwsConfig, ImageMapping, LibvirtConfig, OperatorConfig, Provider};
    use crate::controller::client::ManagedObject;
    use crate::controller::resources::*;
    use crate::error::Error;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn images() -> ImageMapping {
        [
            ("clusterAPIServer", "quay.io/openshift/cluster-api-apiserver:v0.0.1"),
            (
                "clusterAPIControllerManager",
                "quay.io/openshift/cluster-api-controller-manager:v0.0.1",
            ),
            ("clusterAPIControllerAWS", "quay.io/openshift/aws-machine-controllers:v0.0.1"),
            ("clusterAPIControllerLibvirt", "quay.io/openshift/libvirt-machine-controllers:v0.0.1"),
        ]
        .into_iter()
        .collect()
    }

    fn aws_config() -> OperatorConfig {
        OperatorConfig {
            target_namespace: "openshift-machine-api".to_string(),
            provider: Provider::Aws,
            aws: Some(AwsConfig {
                cluster_name: "meh".to_string(),
                cluster_id: "4a5f-11e8".to_string(),
                region: "us-east-1".to_string(),
                availability_zone: "us-east-1a".to_string(),
                image: "ami-0af8953af3ec06b7c".to_string(),
                replicas: 3,
            }),
            libvirt: None,
            images: images(),
        }
    }

    fn libvirt_config() -> OperatorConfig {
        OperatorConfig {
            target_namespace: "openshift-machine-api".to_string(),
            provider: Provider::Libvirt,
            aws: None,
            libvirt: Some(LibvirtConfig {
                uri: "qemu+tcp://192.168.122.1/system".to_string(),
                network_name: "actuator".to_string(),
                ip_range: "192.168.124.0/24".to_string(),
                replicas: 1,
                cluster_name: "test".to_string(),
            }),
            images: images(),
        }
    }

    fn deployment(objects: &[ManagedObject]) -> &k8s_openapi::api::apps::v1::Deployment {
        objects
            .iter()
            .find_map(|o| match o {
                ManagedObject::Deployment(d) => Some(d),
                _ => None,
            })
            .expect("no deployment in stage output")
    }

    fn container_images(objects: &[ManagedObject]) -> Vec<String> {
        deployment(objects)
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.iter().filter_map(|c| c.image.clone()).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Component stages
    // -----------------------------------------------------------------------

    #[test]
    fn test_api_server_uses_configured_image() {
        let objects = cluster_api_server_objects(&aws_config()).unwrap();
        assert_eq!(objects.len(), 2);
        assert!(container_images(&objects)
            .contains(&"quay.io/openshift/cluster-api-apiserver:v0.0.1".to_string()));

        let d = deployment(&objects);
        assert_eq!(d.metadata.name.as_deref(), Some(API_SERVER_NAME));
        assert_eq!(d.metadata.namespace.as_deref(), Some("openshift-machine-api"));
        assert!(matches!(&objects[1], ManagedObject::Service(s)
            if s.metadata.name.as_deref() == Some(API_SERVER_SERVICE_NAME)));
    }

    #[test]
    fn test_api_server_without_image_fails() {
        let mut config = aws_config();
        config.images = ImageMapping::default();
        let err = cluster_api_server_objects(&config).unwrap_err();
        assert!(matches!(err, Error::MissingImage(ref c) if c == CLUSTER_API_SERVER));
    }

    #[test]
    fn test_controllers_pick_provider_machine_controller() {
        let aws = container_images(&cluster_api_controller_objects(&aws_config()).unwrap());
        assert!(aws.contains(&"quay.io/openshift/aws-machine-controllers:v0.0.1".to_string()));

        let libvirt = container_images(&cluster_api_controller_objects(&libvirt_config()).unwrap());
        assert!(libvirt
            .contains(&"quay.io/openshift/libvirt-machine-controllers:v0.0.1".to_string()));
        assert!(!libvirt.iter().any(|i| i.contains("aws")));
    }

    #[test]
    fn test_controllers_require_provider_image() {
        let mut config = libvirt_config();
        config.images = [("clusterAPIControllerManager", "manager:v1")]
            .into_iter()
            .collect();
        let err = cluster_api_controller_objects(&config).unwrap_err();
        assert!(matches!(err, Error::MissingImage(ref c) if c == CLUSTER_API_CONTROLLER_LIBVIRT));
    }

    #[test]
    fn test_builders_are_deterministic() {
        let config = aws_config();
        let build = || {
            let objects = cluster_api_controller_objects(&config).unwrap();
            serde_json::to_value(deployment(&objects)).unwrap()
        };
        let (first, second) = (build(), build());
        assert_eq!(first, second);
    }

    #[test]
    fn test_rbac_binds_controllers_account() {
        let objects = rbac_objects(&aws_config());
        let kinds: Vec<&str> = objects.iter().map(ManagedObject::kind).collect();
        assert_eq!(kinds, vec!["ServiceAccount", "ClusterRole", "ClusterRoleBinding"]);

        let ManagedObject::ClusterRoleBinding(binding) = &objects[2] else {
            panic!("expected a ClusterRoleBinding");
        };
        let subject = &binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.name, CONTROLLERS_ACCOUNT);
        assert_eq!(subject.namespace.as_deref(), Some("openshift-machine-api"));
        assert_eq!(objects[1].namespace(), None);
    }

    // -----------------------------------------------------------------------
    // Bootstrap topology
    // -----------------------------------------------------------------------

    #[test]
    fn test_cluster_object() {
        let cluster = build_cluster(&aws_config()).unwrap();
        assert_eq!(cluster.metadata.name.as_deref(), Some("meh"));
        assert_eq!(cluster.metadata.namespace.as_deref(), Some("openshift-machine-api"));
        assert_eq!(cluster.spec.cluster_network.pods.cidr_blocks, vec!["10.2.0.0/16"]);
        assert_eq!(
            cluster.spec.provider_config.value.as_ref().unwrap()["region"],
            "us-east-1"
        );

        let libvirt = build_cluster(&libvirt_config()).unwrap();
        assert!(libvirt.spec.provider_config.value.is_none());
    }

    #[test]
    fn test_machine_set_selector_matches_template() {
        let ms = build_machine_set(&aws_config()).unwrap();
        assert_eq!(ms.metadata.name.as_deref(), Some("meh-worker"));
        assert_eq!(ms.spec.replicas, 3);

        let template_labels = &ms.spec.template.metadata.labels;
        for (k, v) in &ms.spec.selector.match_labels {
            assert_eq!(template_labels.get(k), Some(v), "selector label {k} not on template");
        }
        assert_eq!(template_labels.get(MACHINE_ROLE_LABEL).map(String::as_str), Some("worker"));
    }

    #[test]
    fn test_machine_set_provider_config() {
        let aws = build_machine_set(&aws_config()).unwrap();
        let value = aws.spec.template.spec.provider_config.value.unwrap();
        assert_eq!(value["kind"], "AWSMachineProviderConfig");
        assert_eq!(value["ami"]["id"], "ami-0af8953af3ec06b7c");
        assert_eq!(value["placement"]["availabilityZone"], "us-east-1a");

        let libvirt = build_machine_set(&libvirt_config()).unwrap();
        let value = libvirt.spec.template.spec.provider_config.value.unwrap();
        assert_eq!(value["networkInterfaceAddress"], "192.168.124.0/24");
        assert_eq!(value["uri"], "qemu+tcp://192.168.122.1/system");
    }

    #[test]
    fn test_machine_set_without_provider_section_fails() {
        let mut config = aws_config();
        config.aws = None;
        assert!(matches!(build_machine_set(&config), Err(Error::ConfigError(_))));
    }
}
