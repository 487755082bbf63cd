use chrono::{DateTime, Utc};
use futures::stream::StreamExt;

use crate::{
    apis::postgrescluster_types::PostgresCluster,
    config::Config,
    exec::{KubePodExec, PodExec},
    exporter_setup::reconcile_exporter_setup,
    instances::observe_instances,
    naming::FIELD_MANAGER,
    postgres_exporter::{reconcile_exporter_queries_config, reconcile_exporter_web_config},
    secret::reconcile_monitoring_secret,
    statefulset::reconcile_instances,
    telemetry, Error, Metrics, Result,
};
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Namespace};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub static PGCLUSTER_FINALIZER: &str = "pgclusters.pgcluster.io";

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Runs commands inside instance pods
    pub pod_exec: Arc<dyn PodExec>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let cfg = Config::default();
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
    let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &ns);

    debug!("Reconciling PostgresCluster \"{}\" in {}", cluster.name_any(), ns);
    finalizer(&clusters, PGCLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => cluster.reconcile(ctx.clone(), &cfg).await,
            Finalizer::Cleanup(cluster) => cluster.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&cluster, error);
    requeue_after_error(error)
}

fn requeue_after_error(error: &Error) -> Action {
    match error {
        Error::StatusConflict(_) => Action::requeue(Duration::from_secs(10)),
        Error::FinalizerError(e) => match e.as_ref() {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => requeue_after_error(inner),
            _ => Action::requeue(Duration::from_secs(5 * 60)),
        },
        _ => Action::requeue(Duration::from_secs(5 * 60)),
    }
}

impl PostgresCluster {
    // Reconcile (for non-finalizer related changes)
    #[instrument(skip(self, ctx, cfg))]
    async fn reconcile(&self, ctx: Arc<Context>, cfg: &Config) -> Result<Action> {
        let client = ctx.client.clone();
        let ns = self
            .namespace()
            .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
        let name = self.name_any();

        let monitoring_secret = reconcile_monitoring_secret(self, ctx.clone()).await?;
        reconcile_exporter_queries_config(self, ctx.clone()).await?;
        let web_config = reconcile_exporter_web_config(self, ctx.clone()).await?;

        reconcile_instances(self, ctx.clone(), web_config.as_ref()).await?;

        let observed = observe_instances(self, client.clone()).await?;
        reconcile_exporter_setup(self, ctx.clone(), &observed, monitoring_secret.as_ref()).await?;

        let instances = observed.names();
        let recorded = self.status.as_ref().map(|s| &s.instances);
        if recorded != Some(&instances) {
            let clusters: Api<PostgresCluster> = Api::namespaced(client, &ns);
            patch_cluster_status_merge(&clusters, &name, json!({ "status": { "instances": instances } }))
                .await?;
        }

        // Check back every reconcile_ttl seconds plus up to a minute of jitter
        let jitter = rand::thread_rng().gen_range(0..60);
        Ok(Action::requeue(Duration::from_secs(cfg.reconcile_ttl + jitter)))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        // Publishing an event into a terminating namespace leaves the namespace hanging
        let ns = self.namespace().unwrap_or_default();
        let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
        let phase = ns_api
            .get_status(&ns)
            .await?
            .status
            .and_then(|s| s.phase);
        if phase.as_deref() == Some("Terminating") {
            return Ok(Action::await_change());
        }
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), self);
        // Owned objects are garbage collected through their owner references
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeletePostgresCluster".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }
}

/// Merge patch the status subresource.
///
/// Including `metadata.resourceVersion` in `patch` makes the write
/// conditional; losing that race comes back as `Error::StatusConflict`.
pub async fn patch_cluster_status_merge(
    clusters: &Api<PostgresCluster>,
    name: &str,
    patch: serde_json::Value,
) -> Result<()> {
    let pp = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    };
    match clusters.patch_status(name, &pp, &Patch::Merge(patch)).await {
        Ok(_) => {
            debug!("Successfully updated PostgresCluster status for {}", name);
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            warn!("Conflict updating PostgresCluster status for {}: {}", name, ae.message);
            Err(Error::StatusConflict(name.to_string()))
        }
        Err(e) => {
            error!("Error updating PostgresCluster status for {}: {:?}", name, e);
            Err(Error::KubeError(e))
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "pgcluster-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client, cluster: &PostgresCluster) -> Recorder {
        Recorder::new(client, self.reporter.clone(), cluster.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client, cfg: &Config) -> Result<Arc<Context>> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .map_err(|e| Error::InvalidErr(format!("metrics registration: {e}")))?;
        Ok(Arc::new(Context {
            pod_exec: Arc::new(KubePodExec::new(
                client.clone(),
                Duration::from_secs(cfg.exec_timeout),
            )),
            client,
            metrics,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Please configure your Kubernetes Context: {e}");
            std::process::exit(1);
        }
    };

    let clusters = Api::<PostgresCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let ctx = match state.create_context(client.clone(), &Config::default()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    Controller::new(clusters, watcherConfig::default().any_semantic())
        .owns(Api::<StatefulSet>::all(client), watcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
