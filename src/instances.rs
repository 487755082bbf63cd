//! Read-only view of the cluster's live instances, rebuilt every pass from
//! the pods the API server reports.
use crate::{
    apis::postgrescluster_types::PostgresCluster,
    naming::{self, DATABASE_CONTAINER, EXPORTER_CONTAINER, LABEL_INSTANCE, ROLE_ANNOTATION},
    Result,
};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt};
use tracing::{debug, warn};

/// A managed cluster member and the pods currently backing it
#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub name: String,
    pub pods: Vec<Pod>,
    /// Name of the StatefulSet controlling the pods, when known
    pub runner: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ObservedInstances {
    pub for_cluster: Vec<Instance>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

#[derive(Deserialize)]
struct RoleStatus {
    role: String,
}

impl Role {
    /// Decode the HA agent's role annotation. Anything unrecognised is an error.
    pub fn from_annotation(value: &str) -> Result<Role, RoleError> {
        let status: RoleStatus = serde_json::from_str(value).map_err(|_| RoleError::Malformed)?;
        match status.role.as_str() {
            "master" | "primary" => Ok(Role::Primary),
            "replica" | "standby_leader" | "standby-leader" => Ok(Role::Replica),
            other => Err(RoleError::Unknown(other.to_string())),
        }
    }

    pub fn of(pod: &Pod) -> Result<Role, RoleError> {
        pod.annotations()
            .get(ROLE_ANNOTATION)
            .ok_or(RoleError::Missing)
            .and_then(|value| Role::from_annotation(value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleError {
    Missing,
    Malformed,
    Unknown(String),
}

/// Why no pod is safe to exec into on this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotReady {
    NoPrimary,
    Terminating(String),
    ContainerNotRunning { pod: String, container: String },
    ImageNotResolved { pod: String, container: String },
    /// More than one pod claims the primary role
    MultiplePrimaries(Vec<String>),
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReady::NoPrimary => write!(f, "no pod is annotated as primary"),
            NotReady::Terminating(pod) => write!(f, "primary pod {pod} is terminating"),
            NotReady::ContainerNotRunning { pod, container } => {
                write!(f, "container {container} of pod {pod} is not running")
            }
            NotReady::ImageNotResolved { pod, container } => {
                write!(f, "container {container} of pod {pod} has no image id yet")
            }
            NotReady::MultiplePrimaries(pods) => {
                write!(f, "pods {} are all annotated as primary", pods.join(", "))
            }
        }
    }
}

/// The primary pod chosen for remote commands this pass
#[derive(Clone, Copy, Debug)]
pub struct ExecTarget<'a> {
    pub instance: &'a Instance,
    pub pod: &'a Pod,
}

impl ExecTarget<'_> {
    pub fn pod_name(&self) -> String {
        self.pod.name_any()
    }
}

impl ObservedInstances {
    /// Group pods into instances by their instance label, falling back to the
    /// owning StatefulSet for pods that lack it.
    pub fn from_pods(pods: Vec<Pod>) -> Self {
        let mut by_name: BTreeMap<String, Instance> = BTreeMap::new();
        for pod in pods {
            let runner = pod.owner_references().iter().find_map(|o| {
                if o.kind == "StatefulSet" {
                    Some(o.name.clone())
                } else {
                    None
                }
            });
            let name = match pod.labels().get(LABEL_INSTANCE).cloned().or_else(|| runner.clone()) {
                Some(name) => name,
                None => {
                    debug!("Ignoring pod {} without an instance", pod.name_any());
                    continue;
                }
            };
            let instance = by_name.entry(name.clone()).or_insert_with(|| Instance {
                name,
                ..Instance::default()
            });
            if instance.runner.is_none() {
                instance.runner = runner;
            }
            instance.pods.push(pod);
        }
        Self {
            for_cluster: by_name.into_values().collect(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.for_cluster.iter().map(|i| i.name.clone()).collect()
    }

    /// Pick the primary pod and decide whether it is safe to exec into.
    ///
    /// Pure: only inspects already observed state. When `exporter_enabled`
    /// the exporter sidecar must be running with a resolved image as well.
    /// Two pods claiming the primary role at once is never safe.
    pub fn primary_target(&self, exporter_enabled: bool) -> Result<ExecTarget<'_>, NotReady> {
        let primaries: Vec<(&Instance, &Pod)> = self
            .for_cluster
            .iter()
            .flat_map(|instance| instance.pods.iter().map(move |pod| (instance, pod)))
            .filter(|(_, pod)| Role::of(pod) == Ok(Role::Primary))
            .collect();
        let (instance, pod) = match primaries.as_slice() {
            [] => return Err(NotReady::NoPrimary),
            [only] => *only,
            many => {
                let names: Vec<String> = many.iter().map(|(_, pod)| pod.name_any()).collect();
                warn!("Multiple pods annotated as primary: {}", names.join(", "));
                return Err(NotReady::MultiplePrimaries(names));
            }
        };

        let pod_name = pod.name_any();
        if pod.metadata.deletion_timestamp.is_some() {
            return Err(NotReady::Terminating(pod_name));
        }

        ensure_running(pod, DATABASE_CONTAINER)?;
        if exporter_enabled {
            ensure_running(pod, EXPORTER_CONTAINER)?;
        }

        Ok(ExecTarget { instance, pod })
    }
}

fn container_status<'a>(pod: &'a Pod, container: &str) -> Option<&'a ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == container))
}

/// A container is usable once it runs with a resolved image id
fn ensure_running(pod: &Pod, container: &str) -> Result<(), NotReady> {
    let status = container_status(pod, container);
    let running = status
        .and_then(|s| s.state.as_ref())
        .map(|state| state.running.is_some())
        .unwrap_or(false);
    if !running {
        return Err(NotReady::ContainerNotRunning {
            pod: pod.name_any(),
            container: container.to_string(),
        });
    }
    match status.map(|s| s.image_id.as_str()) {
        Some(image_id) if !image_id.is_empty() => Ok(()),
        _ => Err(NotReady::ImageNotResolved {
            pod: pod.name_any(),
            container: container.to_string(),
        }),
    }
}

/// List the cluster's pods and group them into instances
pub async fn observe_instances(cluster: &PostgresCluster, client: Client) -> Result<ObservedInstances> {
    let ns = cluster.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client, &ns);
    let lp = ListParams::default().labels(&naming::cluster_selector(cluster));
    let pod_list = pods.list(&lp).await?;
    Ok(ObservedInstances::from_pods(pod_list.items))
}
