//! In-memory [`ClusterApi`] for tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::client::{ApplyOutcome, ClusterApi, ManagedObject};
use crate::config::operator::{CLUSTER_CONFIG_NAME, CLUSTER_CONFIG_NAMESPACE, OPERATOR_CONFIG_KEY};
use crate::crd::{Cluster, MachineSet};
use crate::error::{Error, Result};

pub const AWS_CONFIG: &str = r#"
provider: aws
aws:
  clusterName: meh
  clusterID: 4a5f-11e8
  region: us-east-1
  availabilityZone: us-east-1a
  image: ami-0af8953af3ec06b7c
  replicas: 2
"#;

pub const IMAGES_JSON: &str = r#"{
  "clusterAPIServer": "quay.io/openshift/cluster-api-apiserver:v0.0.1",
  "clusterAPIControllerManager": "quay.io/openshift/cluster-api-controller-manager:v0.0.1",
  "clusterAPIControllerAWS": "quay.io/openshift/aws-machine-controllers:v0.0.1",
  "clusterAPIControllerLibvirt": "quay.io/openshift/libvirt-machine-controllers:v0.0.1"
}"#;

#[derive(Default)]
struct FakeState {
    config_maps: BTreeMap<(String, String), ConfigMap>,
    crds: BTreeSet<String>,
    objects: BTreeMap<String, serde_json::Value>,
    clusters: Vec<String>,
    machine_sets: Vec<String>,
    calls: Vec<String>,
    mutations: usize,
    /// Remaining injected failures per operation
    failures: HashMap<String, u32>,
    /// Artificial latency per operation
    delays: HashMap<String, Duration>,
}

impl FakeState {
    /// Record a call to `op` and consume an injected failure if one is armed
    fn call(&mut self, op: &str, detail: &str) -> Result<()> {
        let full = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op}:{detail}")
        };
        self.calls.push(full.clone());

        for candidate in [full.as_str(), op] {
            if let Some(remaining) = self.failures.get_mut(candidate) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(injected(&full));
                }
            }
        }
        Ok(())
    }
}

fn injected(op: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure for {op}"),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

/// Cluster that keeps every object in memory and can fail on demand
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<FakeState>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster with `kube-system/cluster-config-v1` carrying `yaml` under `mao-config`
    pub fn with_operator_config(yaml: &str) -> Self {
        let fake = Self::new();
        fake.set_config_map(
            CLUSTER_CONFIG_NAMESPACE,
            CLUSTER_CONFIG_NAME,
            [(OPERATOR_CONFIG_KEY, yaml)],
        );
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config_map<'a>(
        &self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.lock()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), cm);
    }

    /// Fail the next `times` calls matching `op`.
    ///
    /// `op` is an operation name (`"apply"`, `"create_cluster"`) or an
    /// operation with detail (`"apply:Deployment/clusterapi-apiserver"`).
    pub fn fail(&self, op: &str, times: u32) {
        self.lock().failures.insert(op.to_string(), times);
    }

    pub fn fail_always(&self, op: &str) {
        self.fail(op, u32::MAX);
    }

    /// Make every call to `op` take `delay` before it runs
    pub fn stall(&self, op: &str, delay: Duration) {
        self.lock().delays.insert(op.to_string(), delay);
    }

    async fn latency(&self, op: &str) {
        let delay = self.lock().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| *c == op || c.starts_with(&format!("{op}:")))
            .count()
    }

    /// Number of writes that changed cluster state
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    pub fn object(&self, kind: &str, name: &str) -> Option<serde_json::Value> {
        self.lock().objects.get(&format!("{kind}/{name}")).cloned()
    }

    pub fn crds(&self) -> Vec<String> {
        self.lock().crds.iter().cloned().collect()
    }

    pub fn clusters_created(&self) -> Vec<String> {
        self.lock().clusters.clone()
    }

    pub fn machine_sets_created(&self) -> Vec<String> {
        self.lock().machine_sets.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.latency("get_config_map").await;
        let mut state = self.lock();
        state.call("get_config_map", &format!("{namespace}/{name}"))?;
        Ok(state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn ensure_crd(&self, crd: &CustomResourceDefinition) -> Result<ApplyOutcome> {
        let mut state = self.lock();
        let name = crd.name_any();
        state.call("ensure_crd", &name)?;
        if state.crds.insert(name) {
            state.mutations += 1;
            Ok(ApplyOutcome::Created)
        } else {
            Ok(ApplyOutcome::Unchanged)
        }
    }

    async fn apply(&self, object: &ManagedObject) -> Result<ApplyOutcome> {
        let id = format!("{}/{}", object.kind(), object.name());
        let desired = match object {
            ManagedObject::ServiceAccount(o) => serde_json::to_value(o)?,
            ManagedObject::ClusterRole(o) => serde_json::to_value(o)?,
            ManagedObject::ClusterRoleBinding(o) => serde_json::to_value(o)?,
            ManagedObject::Deployment(o) => serde_json::to_value(o)?,
            ManagedObject::Service(o) => serde_json::to_value(o)?,
        };

        let mut state = self.lock();
        state.call("apply", &id)?;
        let outcome = match state.objects.get(&id) {
            None => ApplyOutcome::Created,
            Some(existing) if *existing == desired => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Updated,
        };
        if outcome != ApplyOutcome::Unchanged {
            state.mutations += 1;
            state.objects.insert(id, desired);
        }
        Ok(outcome)
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.latency("create_cluster").await;
        let mut state = self.lock();
        let name = cluster.name_any();
        state.call("create_cluster", &name)?;
        if !state.clusters.contains(&name) {
            state.mutations += 1;
        }
        state.clusters.push(name);
        Ok(())
    }

    async fn create_machine_set(&self, machine_set: &MachineSet) -> Result<()> {
        self.latency("create_machine_set").await;
        let mut state = self.lock();
        let name = machine_set.name_any();
        state.call("create_machine_set", &name)?;
        if !state.machine_sets.contains(&name) {
            state.mutations += 1;
        }
        state.machine_sets.push(name);
        Ok(())
    }
}
