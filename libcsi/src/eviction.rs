//! Cluster-level pod eviction after a node plugin restart.
//!
//! When the plugin process dies, every FUSE provider it started dies with
//! it and the workloads using those volumes are left with dead mounts.
//! [`run`] deletes the affected pods so their controllers recreate them and
//! the volumes get staged and published afresh.
//!
//! The Kubernetes client is not part of this crate; callers supply one
//! through [`ClusterApi`].

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Owner kinds whose pods are recreated after deletion.
pub const CONTROLLER_OWNER_KINDS: [&str; 3] = ["DaemonSet", "StatefulSet", "ReplicaSet"];

/// `namespace/name` reference to a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    pub namespace: String,
    pub name: String,
}

impl ObjRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The parts of a pod the eviction decision looks at.
#[derive(Debug, Clone)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    /// `spec.nodeName`.
    pub node_name: String,
    /// `kind` of every owner reference.
    pub owner_kinds: Vec<String>,
    pub created_at: SystemTime,
    /// Claim names of the pod's PersistentVolumeClaim volume sources.
    pub claims: Vec<String>,
}

impl Pod {
    pub fn obj_ref(&self) -> ObjRef {
        ObjRef::new(&self.namespace, &self.name)
    }
}

/// Failure reported by a [`ClusterApi`] call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ApiError(pub String);

/// Cluster operations the eviction run needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Pods scheduled on `node_name`.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError>;

    /// Name of the PersistentVolume bound to `claim`, `None` while unbound.
    async fn bound_volume(&self, claim: &ObjRef) -> Result<Option<String>, ApiError>;

    /// CSI driver of PersistentVolume `name`, `None` for non-CSI volumes.
    async fn volume_driver(&self, name: &str) -> Result<Option<String>, ApiError>;

    async fn delete_pod(&self, pod: &ObjRef) -> Result<(), ApiError>;
}

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("failed to LIST Pods on node {node}: {source}")]
    ListPods { node: String, source: ApiError },
    #[error("failed to GET PersistentVolumeClaim {claim}: {source}")]
    GetClaim { claim: ObjRef, source: ApiError },
    #[error("failed to GET PersistentVolume {name}: {source}")]
    GetVolume { name: String, source: ApiError },
    #[error("failed to DELETE Pod {pod}: {source}")]
    DeletePod { pod: ObjRef, source: ApiError },
}

/// Parameters of one eviction run.
#[derive(Debug, Clone)]
pub struct EvictionOpts {
    pub node_name: String,
    pub driver_name: String,
    /// Only pods created strictly before this instant are evicted.
    pub reconciliation_time: SystemTime,
}

/// A pod with no controller owner would not come back after deletion.
pub fn is_static_pod(pod: &Pod) -> bool {
    !pod.owner_kinds
        .iter()
        .any(|kind| CONTROLLER_OWNER_KINDS.contains(&kind.as_str()))
}

/// Pick the pods on the node that use a volume of the configured driver.
///
/// Claim lookups are cached for the duration of the call, keyed by
/// `namespace/claim`.
pub async fn select_pods_for_deletion(
    api: &dyn ClusterApi,
    opts: &EvictionOpts,
    pods: &[Pod],
) -> Result<Vec<ObjRef>, EvictionError> {
    let mut managed_claims: HashMap<ObjRef, bool> = HashMap::new();
    let mut selected = Vec::new();

    for pod in pods {
        let pod_ref = pod.obj_ref();
        if pod.node_name != opts.node_name {
            debug!(pod = %pod_ref, node = %opts.node_name, "pod is not scheduled on node, skipping");
            continue;
        }
        if is_static_pod(pod) {
            debug!(pod = %pod_ref, "pod is not managed by a DaemonSet/StatefulSet/ReplicaSet, skipping");
            continue;
        }
        if pod.created_at >= opts.reconciliation_time {
            debug!(pod = %pod_ref, "pod was created after the reconciliation time, skipping");
            continue;
        }
        if !uses_driver_volume(api, opts, pod, &mut managed_claims).await? {
            debug!(pod = %pod_ref, driver = %opts.driver_name, "pod has no volumes managed by driver, skipping");
            continue;
        }
        selected.push(pod_ref);
    }
    Ok(selected)
}

async fn uses_driver_volume(
    api: &dyn ClusterApi,
    opts: &EvictionOpts,
    pod: &Pod,
    managed_claims: &mut HashMap<ObjRef, bool>,
) -> Result<bool, EvictionError> {
    for claim in &pod.claims {
        let claim = ObjRef::new(&pod.namespace, claim);
        if let Some(&managed) = managed_claims.get(&claim) {
            if managed {
                return Ok(true);
            }
            continue;
        }

        let managed = match api
            .bound_volume(&claim)
            .await
            .map_err(|source| EvictionError::GetClaim {
                claim: claim.clone(),
                source,
            })? {
            None => false,
            Some(volume) => {
                let driver = api.volume_driver(&volume).await.map_err(|source| {
                    EvictionError::GetVolume {
                        name: volume.clone(),
                        source,
                    }
                })?;
                driver.as_deref() == Some(opts.driver_name.as_str())
            }
        };
        managed_claims.insert(claim, managed);
        if managed {
            return Ok(true);
        }
    }
    Ok(false)
}

/// List the node's pods, select the affected ones and delete them.
///
/// Stops at the first API error.
pub async fn run(api: &dyn ClusterApi, opts: &EvictionOpts) -> Result<Vec<ObjRef>, EvictionError> {
    let pods = api
        .list_pods_on_node(&opts.node_name)
        .await
        .map_err(|source| EvictionError::ListPods {
            node: opts.node_name.clone(),
            source,
        })?;
    info!(count = pods.len(), node = %opts.node_name, "found pods on node");

    let selected = select_pods_for_deletion(api, opts, &pods).await?;
    info!(count = selected.len(), pods = ?selected, "selected pods for deletion");

    for pod in &selected {
        api.delete_pod(pod)
            .await
            .map_err(|source| EvictionError::DeletePod {
                pod: pod.clone(),
                source,
            })?;
        info!(%pod, "deleted pod");
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    const DRIVER: &str = "fuse.csi.rk8s.io";

    #[derive(Default)]
    struct FakeCluster {
        pods: Vec<Pod>,
        claims: HashMap<ObjRef, String>,
        drivers: HashMap<String, String>,
        claim_lookups: Mutex<usize>,
        deleted: Mutex<Vec<ObjRef>>,
        fail_delete: bool,
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError> {
            Ok(self
                .pods
                .iter()
                .filter(|p| p.node_name == node_name)
                .cloned()
                .collect())
        }

        async fn bound_volume(&self, claim: &ObjRef) -> Result<Option<String>, ApiError> {
            *self.claim_lookups.lock().unwrap() += 1;
            Ok(self.claims.get(claim).cloned())
        }

        async fn volume_driver(&self, name: &str) -> Result<Option<String>, ApiError> {
            Ok(self.drivers.get(name).cloned())
        }

        async fn delete_pod(&self, pod: &ObjRef) -> Result<(), ApiError> {
            if self.fail_delete {
                return Err(ApiError("forbidden".into()));
            }
            self.deleted.lock().unwrap().push(pod.clone());
            Ok(())
        }
    }

    fn opts() -> EvictionOpts {
        EvictionOpts {
            node_name: "node-1".into(),
            driver_name: DRIVER.into(),
            reconciliation_time: SystemTime::UNIX_EPOCH + Duration::from_secs(1000),
        }
    }

    fn pod(name: &str, claims: &[&str]) -> Pod {
        Pod {
            namespace: "default".into(),
            name: name.into(),
            node_name: "node-1".into(),
            owner_kinds: vec!["ReplicaSet".into()],
            created_at: SystemTime::UNIX_EPOCH + Duration::from_secs(10),
            claims: claims.iter().map(|c| (*c).to_owned()).collect(),
        }
    }

    fn cluster(pods: Vec<Pod>) -> FakeCluster {
        FakeCluster {
            pods,
            claims: HashMap::from([
                (ObjRef::new("default", "fuse-claim"), "pv-fuse".to_owned()),
                (ObjRef::new("default", "other-claim"), "pv-other".to_owned()),
            ]),
            drivers: HashMap::from([
                ("pv-fuse".to_owned(), DRIVER.to_owned()),
                ("pv-other".to_owned(), "ebs.csi.aws.com".to_owned()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn static_pods() {
        let mut p = pod("a", &[]);
        assert!(!is_static_pod(&p));
        p.owner_kinds = vec!["Node".into()];
        assert!(is_static_pod(&p));
        p.owner_kinds.clear();
        assert!(is_static_pod(&p));
    }

    #[tokio::test]
    async fn selects_only_eligible_pods() {
        let mut on_other_node = pod("elsewhere", &["fuse-claim"]);
        on_other_node.node_name = "node-2".into();
        let mut unowned = pod("static", &["fuse-claim"]);
        unowned.owner_kinds.clear();
        let mut too_new = pod("new", &["fuse-claim"]);
        too_new.created_at = opts().reconciliation_time;

        let pods = vec![
            pod("uses-fuse", &["other-claim", "fuse-claim"]),
            pod("uses-other", &["other-claim"]),
            pod("unbound", &["pending-claim"]),
            pod("no-claims", &[]),
            on_other_node,
            unowned,
            too_new,
        ];
        let api = cluster(Vec::new());
        let selected = select_pods_for_deletion(&api, &opts(), &pods)
            .await
            .unwrap();
        assert_eq!(selected, vec![ObjRef::new("default", "uses-fuse")]);
    }

    #[tokio::test]
    async fn claim_lookups_are_cached_per_namespace() {
        let mut in_other_ns = pod("c", &["fuse-claim"]);
        in_other_ns.namespace = "team-b".into();
        let pods = vec![
            pod("a", &["fuse-claim"]),
            pod("b", &["fuse-claim"]),
            in_other_ns,
        ];
        let api = cluster(Vec::new());
        let selected = select_pods_for_deletion(&api, &opts(), &pods)
            .await
            .unwrap();

        // team-b/fuse-claim is a different, unbound claim.
        assert_eq!(
            selected,
            vec![ObjRef::new("default", "a"), ObjRef::new("default", "b")]
        );
        assert_eq!(*api.claim_lookups.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn run_deletes_selected_pods() {
        let api = cluster(vec![pod("a", &["fuse-claim"]), pod("b", &["other-claim"])]);
        let deleted = run(&api, &opts()).await.unwrap();
        assert_eq!(deleted, vec![ObjRef::new("default", "a")]);
        assert_eq!(*api.deleted.lock().unwrap(), deleted);
    }

    #[tokio::test]
    async fn run_stops_on_delete_error() {
        let mut api = cluster(vec![pod("a", &["fuse-claim"])]);
        api.fail_delete = true;
        let err = run(&api, &opts()).await.unwrap_err();
        assert!(matches!(err, EvictionError::DeletePod { .. }));
        assert_eq!(
            err.to_string(),
            "failed to DELETE Pod default/a: forbidden"
        );
    }
}
