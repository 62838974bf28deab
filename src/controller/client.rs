//! Narrow interface to the Kubernetes API used by the pipeline and bootstrap
//!
//! Everything the operator reads or writes goes through [`ClusterApi`], so the
//! reconciliation logic can run against an in-memory cluster in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::crd::{Cluster, MachineSet};
use crate::error::{Error, Result};

/// Field manager recorded on every server-side apply
pub const FIELD_MANAGER: &str = "machine-api-operator";

/// Objects converged by the sync pipeline
#[derive(Clone, Debug)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Deployment(Deployment),
    Service(Service),
}

impl ManagedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ManagedObject::ServiceAccount(_) => "ServiceAccount",
            ManagedObject::ClusterRole(_) => "ClusterRole",
            ManagedObject::ClusterRoleBinding(_) => "ClusterRoleBinding",
            ManagedObject::Deployment(_) => "Deployment",
            ManagedObject::Service(_) => "Service",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ManagedObject::ServiceAccount(o) => o.name_any(),
            ManagedObject::ClusterRole(o) => o.name_any(),
            ManagedObject::ClusterRoleBinding(o) => o.name_any(),
            ManagedObject::Deployment(o) => o.name_any(),
            ManagedObject::Service(o) => o.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            ManagedObject::ServiceAccount(o) => o.namespace(),
            ManagedObject::ClusterRole(_) | ManagedObject::ClusterRoleBinding(_) => None,
            ManagedObject::Deployment(o) => o.namespace(),
            ManagedObject::Service(o) => o.namespace(),
        }
    }
}

/// What an idempotent write did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a ConfigMap, `None` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Register a CRD unless one with the same name is already present
    async fn ensure_crd(&self, crd: &CustomResourceDefinition) -> Result<ApplyOutcome>;

    /// Converge an object to the given desired state
    async fn apply(&self, object: &ManagedObject) -> Result<ApplyOutcome>;

    /// Create the bootstrap Cluster object; an existing object counts as success
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Create the bootstrap MachineSet object; an existing object counts as success
    async fn create_machine_set(&self, machine_set: &MachineSet) -> Result<()>;
}

/// [`ClusterApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, object: &K) -> Result<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = object.meta().namespace.as_deref().ok_or_else(|| {
            Error::ConfigError(format!(
                "{} {} has no namespace",
                K::kind(&()),
                object.meta().name.as_deref().unwrap_or_default()
            ))
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

/// Server-side apply `object`, comparing resourceVersions to detect no-ops
async fn server_side_apply<K>(api: &Api<K>, object: &K) -> Result<ApplyOutcome>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object.name_any();
    let before = api
        .get_opt(&name)
        .await?
        .and_then(|existing| existing.resource_version());

    let applied = api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await?;

    let outcome = match before {
        None => ApplyOutcome::Created,
        Some(rv) if applied.resource_version().as_deref() == Some(rv.as_str()) => {
            ApplyOutcome::Unchanged
        }
        Some(_) => ApplyOutcome::Updated,
    };
    debug!("{} {} {:?}", K::kind(&()), name, outcome);
    Ok(outcome)
}

/// Create `object`, treating AlreadyExists as success
async fn create_if_absent<K>(api: &Api<K>, object: &K) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn ensure_crd(&self, crd: &CustomResourceDefinition) -> Result<ApplyOutcome> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        if api.get_opt(&crd.name_any()).await?.is_some() {
            return Ok(ApplyOutcome::Unchanged);
        }
        if create_if_absent(&api, crd).await? {
            info!("Registered CRD {}", crd.name_any());
            Ok(ApplyOutcome::Created)
        } else {
            Ok(ApplyOutcome::Unchanged)
        }
    }

    async fn apply(&self, object: &ManagedObject) -> Result<ApplyOutcome> {
        match object {
            ManagedObject::ServiceAccount(o) => server_side_apply(&self.namespaced(o)?, o).await,
            ManagedObject::Deployment(o) => server_side_apply(&self.namespaced(o)?, o).await,
            ManagedObject::Service(o) => server_side_apply(&self.namespaced(o)?, o).await,
            ManagedObject::ClusterRole(o) => {
                server_side_apply(&Api::all(self.client.clone()), o).await
            }
            ManagedObject::ClusterRoleBinding(o) => {
                server_side_apply(&Api::all(self.client.clone()), o).await
            }
        }
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        if !create_if_absent(&self.namespaced(cluster)?, cluster).await? {
            debug!("Cluster {} already exists", cluster.name_any());
        }
        Ok(())
    }

    async fn create_machine_set(&self, machine_set: &MachineSet) -> Result<()> {
        if !create_if_absent(&self.namespaced(machine_set)?, machine_set).await? {
            debug!("MachineSet {} already exists", machine_set.name_any());
        }
        Ok(())
    }
}
