//! Kubernetes resource builders for the Cluster API components
//!
//! Every builder is a pure function of the resolved [`OperatorConfig`], so
//! running a stage twice produces byte-identical desired state.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServiceAccount, ServicePort,
    ServiceSpec, Toleration,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;

use super::client::ManagedObject;
use crate::config::images::{
    CLUSTER_API_CONTROLLER_AWS, CLUSTER_API_CONTROLLER_LIBVIRT, CLUSTER_API_CONTROLLER_MANAGER,
    CLUSTER_API_SERVER,
};
use crate::config::{OperatorConfig, Provider};
use crate::crd::{
    Cluster, ClusterNetworkingConfig, ClusterSpec, MachineSelector, MachineSet, MachineSetSpec,
    MachineSpec, MachineTemplateMeta, MachineTemplateSpec, NetworkRanges, ProviderConfig,
};
use crate::error::Result;

pub const API_SERVER_NAME: &str = "clusterapi-apiserver";
pub const API_SERVER_SERVICE_NAME: &str = "clusterapi";
pub const CONTROLLERS_NAME: &str = "clusterapi-controllers";
/// Identity shared by the controllers' ServiceAccount, ClusterRole and binding
pub const CONTROLLERS_ACCOUNT: &str = "machine-api-controllers";

const API_SERVER_PORT: i32 = 6443;
const SERVICE_CIDR: &str = "10.3.0.0/16";
const POD_CIDR: &str = "10.2.0.0/16";
const SERVICE_DOMAIN: &str = "tectonic.local";

pub const CLUSTER_LABEL: &str = "sigs.k8s.io/cluster-api-cluster";
pub const MACHINE_ROLE_LABEL: &str = "sigs.k8s.io/cluster-api-machine-role";
pub const MACHINE_TYPE_LABEL: &str = "sigs.k8s.io/cluster-api-machine-type";
pub const MACHINE_SET_LABEL: &str = "sigs.k8s.io/cluster-api-machineset";

/// Get the standard labels for a managed component
pub fn standard_labels(component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), component.to_string());
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        "machine-api".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "machine-api-operator".to_string(),
    );
    labels
}

/// Pod selector for a component; kept separate from the full label set so
/// label additions never change an immutable selector
fn selector_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app.kubernetes.io/name".to_string(), component.to_string())])
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(standard_labels(name)),
        ..Default::default()
    }
}

fn master_tolerations() -> Vec<Toleration> {
    vec![Toleration {
        key: Some("node-role.kubernetes.io/master".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }]
}

fn build_deployment(
    name: &str,
    namespace: &str,
    service_account: Option<&str>,
    containers: Vec<Container>,
) -> Deployment {
    let selector = selector_labels(name);
    Deployment {
        metadata: meta(name, Some(namespace)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    service_account_name: service_account.map(str::to_string),
                    node_selector: Some(BTreeMap::from([(
                        "node-role.kubernetes.io/master".to_string(),
                        String::new(),
                    )])),
                    tolerations: Some(master_tolerations()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Cluster API server
// ============================================================================

/// Objects converged by the cluster-API-server stage
pub fn cluster_api_server_objects(config: &OperatorConfig) -> Result<Vec<ManagedObject>> {
    let image = config.images.require(CLUSTER_API_SERVER)?;
    let namespace = config.target_namespace.as_str();

    let apiserver = Container {
        name: "apiserver".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["./apiserver".to_string()]),
        args: Some(vec![
            "--etcd-servers=http://localhost:2379".to_string(),
            format!("--secure-port={API_SERVER_PORT}"),
            "--v=3".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: API_SERVER_PORT,
            ..Default::default()
        }]),
        ..Default::default()
    };
    let etcd = Container {
        name: "etcd".to_string(),
        image: Some("quay.io/coreos/etcd:latest".to_string()),
        command: Some(vec![
            "/usr/local/bin/etcd".to_string(),
            "--listen-client-urls=http://0.0.0.0:2379".to_string(),
            "--advertise-client-urls=http://localhost:2379".to_string(),
            "--data-dir=/etcd-data".to_string(),
        ]),
        ..Default::default()
    };

    let deployment = build_deployment(API_SERVER_NAME, namespace, None, vec![apiserver, etcd]);

    let service = Service {
        metadata: meta(API_SERVER_SERVICE_NAME, Some(namespace)),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(API_SERVER_NAME)),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(API_SERVER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    };

    Ok(vec![
        ManagedObject::Deployment(deployment),
        ManagedObject::Service(service),
    ])
}

// ============================================================================
// Cluster API controllers
// ============================================================================

/// Image component running the machine controller for `provider`
pub fn machine_controller_component(provider: Provider) -> &'static str {
    match provider {
        Provider::Aws => CLUSTER_API_CONTROLLER_AWS,
        Provider::Libvirt => CLUSTER_API_CONTROLLER_LIBVIRT,
    }
}

/// Objects converged by the cluster-API-controller stage
pub fn cluster_api_controller_objects(config: &OperatorConfig) -> Result<Vec<ManagedObject>> {
    let manager_image = config.images.require(CLUSTER_API_CONTROLLER_MANAGER)?;
    let machine_image = config
        .images
        .require(machine_controller_component(config.provider))?;

    let manager = Container {
        name: "controller-manager".to_string(),
        image: Some(manager_image.to_string()),
        command: Some(vec!["./controller-manager".to_string()]),
        ..Default::default()
    };
    let machine_controller = Container {
        name: "machine-controller".to_string(),
        image: Some(machine_image.to_string()),
        command: Some(vec!["./machine-controller".to_string()]),
        args: Some(vec![
            "--logtostderr=true".to_string(),
            "--v=3".to_string(),
            format!("--namespace={}", config.target_namespace),
        ]),
        ..Default::default()
    };

    let deployment = build_deployment(
        CONTROLLERS_NAME,
        &config.target_namespace,
        Some(CONTROLLERS_ACCOUNT),
        vec![manager, machine_controller],
    );
    Ok(vec![ManagedObject::Deployment(deployment)])
}

// ============================================================================
// Remaining managed resources
// ============================================================================

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// RBAC objects for the Cluster API controllers
pub fn rbac_objects(config: &OperatorConfig) -> Vec<ManagedObject> {
    let account = ServiceAccount {
        metadata: meta(CONTROLLERS_ACCOUNT, Some(&config.target_namespace)),
        ..Default::default()
    };

    let role = ClusterRole {
        metadata: meta(CONTROLLERS_ACCOUNT, None),
        rules: Some(vec![
            rule(&["cluster.k8s.io"], &["*"], &["*"]),
            rule(&[""], &["nodes", "secrets", "configmaps"], &["get", "list", "watch"]),
            rule(&[""], &["nodes"], &["update", "patch", "delete"]),
            rule(&[""], &["events"], &["create", "patch"]),
        ]),
        ..Default::default()
    };

    let binding = ClusterRoleBinding {
        metadata: meta(CONTROLLERS_ACCOUNT, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CONTROLLERS_ACCOUNT.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CONTROLLERS_ACCOUNT.to_string(),
            namespace: Some(config.target_namespace.clone()),
            ..Default::default()
        }]),
    };

    vec![
        ManagedObject::ServiceAccount(account),
        ManagedObject::ClusterRole(role),
        ManagedObject::ClusterRoleBinding(binding),
    ]
}

// ============================================================================
// Bootstrap topology
// ============================================================================

/// The Cluster object describing the cluster being managed
pub fn build_cluster(config: &OperatorConfig) -> Result<Cluster> {
    let cluster_name = config.cluster_name()?;

    let provider_config = match config.provider {
        Provider::Aws => {
            let aws = config.aws()?;
            ProviderConfig::from_value(json!({
                "apiVersion": "awsproviderconfig/v1alpha1",
                "kind": "AWSClusterProviderConfig",
                "region": aws.region,
            }))
        }
        Provider::Libvirt => ProviderConfig::default(),
    };

    let mut cluster = Cluster::new(
        cluster_name,
        ClusterSpec {
            cluster_network: ClusterNetworkingConfig {
                services: NetworkRanges {
                    cidr_blocks: vec![SERVICE_CIDR.to_string()],
                },
                pods: NetworkRanges {
                    cidr_blocks: vec![POD_CIDR.to_string()],
                },
                service_domain: SERVICE_DOMAIN.to_string(),
            },
            provider_config,
        },
    );
    cluster.metadata.namespace = Some(config.target_namespace.clone());
    cluster.metadata.labels = Some(standard_labels(cluster_name));
    Ok(cluster)
}

fn machine_provider_config(config: &OperatorConfig) -> Result<ProviderConfig> {
    let value = match config.provider {
        Provider::Aws => {
            let aws = config.aws()?;
            json!({
                "apiVersion": "awsproviderconfig/v1alpha1",
                "kind": "AWSMachineProviderConfig",
                "ami": {"id": aws.image},
                "instanceType": "m4.large",
                "placement": {
                    "region": aws.region,
                    "availabilityZone": aws.availability_zone,
                },
                "subnet": {
                    "filters": [{
                        "name": "tag:Name",
                        "values": [format!(
                            "{}-worker-{}",
                            aws.cluster_name, aws.availability_zone
                        )],
                    }],
                },
                "iamInstanceProfile": {"id": format!("{}-worker-profile", aws.cluster_name)},
                "securityGroups": [{
                    "filters": [{
                        "name": "tag:Name",
                        "values": [format!("{}_worker_sg", aws.cluster_name)],
                    }],
                }],
                "tags": [{"name": "tectonicClusterID", "value": aws.cluster_id}],
                "publicIp": true,
            })
        }
        Provider::Libvirt => {
            let libvirt = config.libvirt()?;
            json!({
                "apiVersion": "libvirtproviderconfig/v1alpha1",
                "kind": "LibvirtMachineProviderConfig",
                "domainMemory": 2048,
                "domainVcpu": 2,
                "ignKey": "/var/lib/libvirt/images/worker.ign",
                "volume": {
                    "poolName": "default",
                    "baseVolumeID": "/var/lib/libvirt/images/coreos_base",
                },
                "networkInterfaceName": libvirt.network_name,
                "networkInterfaceAddress": libvirt.ip_range,
                "autostart": false,
                "uri": libvirt.uri,
            })
        }
    };
    Ok(ProviderConfig::from_value(value))
}

/// The worker MachineSet created during bootstrap
pub fn build_machine_set(config: &OperatorConfig) -> Result<MachineSet> {
    let cluster_name = config.cluster_name()?;
    let name = format!("{cluster_name}-worker");

    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (MACHINE_SET_LABEL.to_string(), name.clone()),
    ]);
    let mut machine_labels = selector.clone();
    machine_labels.insert(MACHINE_ROLE_LABEL.to_string(), "worker".to_string());
    machine_labels.insert(MACHINE_TYPE_LABEL.to_string(), "worker".to_string());

    let mut machine_set = MachineSet::new(
        &name,
        MachineSetSpec {
            replicas: config.worker_replicas()?,
            min_ready_seconds: 0,
            selector: MachineSelector {
                match_labels: selector,
            },
            template: MachineTemplateSpec {
                metadata: MachineTemplateMeta {
                    labels: machine_labels.clone(),
                    ..Default::default()
                },
                spec: MachineSpec {
                    provider_config: machine_provider_config(config)?,
                    versions: None,
                },
            },
        },
    );
    machine_set.metadata.namespace = Some(config.target_namespace.clone());
    machine_set.metadata.labels = Some(machine_labels);
    Ok(machine_set)
}
