//! Change-notification bridge between Kubernetes watches and the work queue
//!
//! One watcher task runs per watched collection. Each turns the raw watch
//! stream into add/update/delete callbacks on a [`ResourceEventHandler`] and
//! flags its cache as synced once the initial list has been delivered.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::queue::RateLimitingQueue;
use super::ReconcileKey;
use crate::config::operator::CLUSTER_CONFIG_NAMESPACE;
use crate::crd::MachineSet;
use crate::error::{Error, Result};

/// Identity of an object reported by a watch
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

/// Callbacks invoked for every change in a watched collection
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &ResourceRef);
    fn on_update(&self, obj: &ResourceRef);
    fn on_delete(&self, obj: &ResourceRef);
}

/// Handler that reacts to any change by enqueuing the operator's own key
pub struct EnqueueDispatcher {
    queue: RateLimitingQueue<ReconcileKey>,
    key: ReconcileKey,
}

impl EnqueueDispatcher {
    pub fn new(queue: RateLimitingQueue<ReconcileKey>, key: ReconcileKey) -> Self {
        Self { queue, key }
    }

    fn enqueue(&self, event: &str, obj: &ResourceRef) {
        trace!(kind = %obj.kind, name = %obj.name, "{} event, queueing {}", event, self.key);
        self.queue.add(self.key.clone());
    }
}

impl ResourceEventHandler for EnqueueDispatcher {
    fn on_add(&self, obj: &ResourceRef) {
        self.enqueue("add", obj);
    }

    fn on_update(&self, obj: &ResourceRef) {
        self.enqueue("update", obj);
    }

    fn on_delete(&self, obj: &ResourceRef) {
        self.enqueue("delete", obj);
    }
}

/// Turns watch events into handler callbacks, tracking which objects exist
#[derive(Default)]
struct EventTracker {
    seen: HashSet<ResourceRef>,
    relist: Option<HashSet<ResourceRef>>,
}

impl EventTracker {
    /// Dispatch `event`; returns true when an initial or re-list completes
    fn handle<K>(&mut self, event: Event<K>, handler: &dyn ResourceEventHandler) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        match event {
            Event::Apply(obj) => {
                let obj = ResourceRef::of(&obj);
                if self.seen.insert(obj.clone()) {
                    handler.on_add(&obj);
                } else {
                    handler.on_update(&obj);
                }
            }
            Event::Delete(obj) => {
                let obj = ResourceRef::of(&obj);
                self.seen.remove(&obj);
                handler.on_delete(&obj);
            }
            Event::Init => {
                self.relist = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                let obj = ResourceRef::of(&obj);
                if self.seen.contains(&obj) {
                    handler.on_update(&obj);
                } else {
                    handler.on_add(&obj);
                }
                self.relist.get_or_insert_with(HashSet::new).insert(obj);
            }
            Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                // objects that vanished while the watch was down
                for gone in self.seen.difference(&listed) {
                    handler.on_delete(gone);
                }
                self.seen = listed;
                return true;
            }
        }
        false
    }
}

async fn watch_collection<K>(
    api: Api<K>,
    handler: Arc<dyn ResourceEventHandler>,
    synced: watch::Sender<bool>,
    token: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let kind = K::kind(&()).to_string();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut tracker = EventTracker::default();

    debug!(%kind, "Watcher started");
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let listed = tracker.handle(event, handler.as_ref());
                if listed && synced.send_if_modified(|s| !std::mem::replace(s, true)) {
                    info!(%kind, "Cache synced");
                }
            }
            Some(Err(e)) => warn!(error = %e, %kind, "Watcher error, will retry"),
            None => break,
        }
    }
    debug!(%kind, "Watcher stopped");
}

/// Initial-list completion of every watched collection
pub struct CacheSync {
    caches: Vec<(String, watch::Receiver<bool>)>,
}

impl CacheSync {
    pub fn new(caches: Vec<(String, watch::Receiver<bool>)>) -> Self {
        Self { caches }
    }

    /// Wait for every cache, failing if `token` fires first
    pub async fn wait(mut self, token: &CancellationToken) -> Result<()> {
        let all = async {
            for (kind, rx) in &mut self.caches {
                if rx.wait_for(|synced| *synced).await.is_err() {
                    warn!(%kind, "Watcher exited before its cache synced");
                    return Err(Error::CacheSyncFailed);
                }
            }
            Ok(())
        };
        tokio::select! {
            _ = token.cancelled() => Err(Error::CacheSyncFailed),
            res = all => res,
        }
    }
}

/// Spawn one watcher per watched collection.
///
/// Namespaced collections are watched in the operator's namespace, except
/// ConfigMaps which are watched where the cluster config lives.
pub fn spawn_watchers(
    client: Client,
    operator_namespace: &str,
    handler: Arc<dyn ResourceEventHandler>,
    token: CancellationToken,
) -> (Vec<JoinHandle<()>>, CacheSync) {
    let mut tasks = Vec::new();
    let mut caches = Vec::new();

    macro_rules! spawn {
        ($kind:ty, $api:expr) => {{
            let (tx, rx) = watch::channel(false);
            caches.push((<$kind as Resource>::kind(&()).to_string(), rx));
            tasks.push(tokio::spawn(watch_collection::<$kind>(
                $api,
                handler.clone(),
                tx,
                token.clone(),
            )));
        }};
    }

    spawn!(MachineSet, Api::namespaced(client.clone(), operator_namespace));
    spawn!(ConfigMap, Api::namespaced(client.clone(), CLUSTER_CONFIG_NAMESPACE));
    spawn!(ServiceAccount, Api::namespaced(client.clone(), operator_namespace));
    spawn!(CustomResourceDefinition, Api::all(client.clone()));
    spawn!(Deployment, Api::namespaced(client.clone(), operator_namespace));
    spawn!(ClusterRole, Api::all(client.clone()));
    spawn!(ClusterRoleBinding, Api::all(client));

    (tasks, CacheSync::new(caches))
}
