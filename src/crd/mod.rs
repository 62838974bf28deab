//! Custom Resource Definitions for the Cluster API
//!
//! The operator registers these kinds and creates the bootstrap `Cluster`
//! and `MachineSet` objects.

mod cluster;
mod machine;
pub mod types;


use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use cluster::{
    ApiEndpoint, Cluster, ClusterNetworkingConfig, ClusterSpec, ClusterStatus, NetworkRanges,
};
pub use machine::{
    Machine, MachineDeployment, MachineDeploymentSpec, MachineDeploymentStatus, MachineSet,
    MachineSetSpec, MachineSetStatus, MachineSpec, MachineStatus, MachineTemplateSpec,
};
pub use types::*;

/// Every CRD the operator must register before the Cluster API can serve objects
pub fn cluster_api_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Cluster::crd(),
        Machine::crd(),
        MachineSet::crd(),
        MachineDeployment::crd(),
    ]
}
