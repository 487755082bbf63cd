//! Helper methods only available for tests
use crate::{
    apis::postgrescluster_types::{
        ExporterSpec, MonitoringSpec, PostgresCluster, PostgresClusterSpec, PostgresClusterStatus,
    },
    defaults,
    exec::{ExecOutput, PodExec},
    naming::{LABEL_INSTANCE, ROLE_ANNOTATION},
    Context, Error, Metrics, PGCLUSTER_FINALIZER,
};
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use k8s_openapi::{
    api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, Namespace, NamespaceStatus, Pod,
        PodStatus, Secret,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::ObjectMeta, client::Body, core::ObjectList, core::TypeMeta, Client, Resource, ResourceExt,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

impl PostgresCluster {
    /// A normal test PostgresCluster
    pub fn test() -> Self {
        let mut c = PostgresCluster::new(
            "testdb",
            PostgresClusterSpec {
                image: defaults::default_image(),
                port: defaults::default_port(),
                instances: defaults::default_instances(),
                resources: defaults::default_resources(),
                storage: defaults::default_storage(),
                ..PostgresClusterSpec::default()
            },
        );
        c.meta_mut().namespace = Some("testns".into());
        c.meta_mut().uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        c
    }

    /// Modify a cluster to declare the exporter with its defaults
    pub fn with_exporter(mut self) -> Self {
        self.spec.monitoring = Some(MonitoringSpec {
            exporter: Some(ExporterSpec {
                image: defaults::default_exporter_image(),
                ..ExporterSpec::default()
            }),
        });
        self
    }

    /// Modify a cluster to have the expected finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(PGCLUSTER_FINALIZER.to_string());
        self
    }

    /// Modify a cluster to have a deletion timestamp
    pub fn needs_delete(mut self) -> Self {
        self.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        self
    }

    /// Modify a cluster to look like it was read at `resource_version`
    pub fn with_resource_version(mut self, resource_version: &str) -> Self {
        self.meta_mut().resource_version = Some(resource_version.to_string());
        self
    }

    /// Modify a cluster to have an expected status
    pub fn with_status(mut self, status: PostgresClusterStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A pod annotated as primary whose listed containers are running with the
/// given image ids
pub fn primary_pod(name: &str, containers: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("testns".to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_INSTANCE.to_string(),
                name.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                ROLE_ANNOTATION.to_string(),
                r#"{"role":"master"}"#.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|(container, image_id)| container_running(container, image_id))
                    .collect(),
            ),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

pub fn container_running(name: &str, image_id: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        image_id: image_id.to_string(),
        state: Some(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        }),
        ..ContainerStatus::default()
    }
}

/// One recorded call to `PodExec::exec`
#[derive(Clone, Debug, PartialEq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub stdin: Option<Vec<u8>>,
    pub command: Vec<String>,
}

/// `PodExec` that records every call and answers with a fixed result
#[derive(Default)]
pub struct RecordingPodExec {
    calls: Mutex<Vec<ExecCall>>,
    failure: Option<String>,
}

impl RecordingPodExec {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodExec for RecordingPodExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        stdin: Option<&[u8]>,
        command: &[String],
    ) -> Result<ExecOutput, Error> {
        self.calls.lock().unwrap().push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
            command: command.to_vec(),
        });
        match &self.failure {
            Some(message) => Err(Error::KubeExecError(message.clone())),
            None => Ok(ExecOutput::default()),
        }
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// objects without finalizers will get a finalizer applied (and not call the apply loop)
    FinalizerCreation(PostgresCluster),
    /// no calls to the API server are expected
    RadioSilence,
    /// monitoring secret does not exist yet and gets applied
    MonitoringSecretCreate,
    /// monitoring secret exists and gets applied again
    MonitoringSecretUpdate(Secret),
    /// reading the monitoring secret fails
    MonitoringSecretUnavailable,
    /// one merge patch of the exporter fingerprint
    ExporterStatusPatch(PostgresCluster),
    /// the fingerprint patch, conditional on the given resourceVersion,
    /// loses an optimistic concurrency race
    ExporterStatusConflict(String),
    /// full apply pass of a finalized cluster with monitoring disabled
    ReconcileWithoutMonitoring(PostgresCluster),
    /// full apply pass of a finalized cluster with monitoring enabled
    ReconcileWithMonitoring(PostgresCluster),
    /// objects with a deletion timestamp will run the cleanup loop sending event and removing the finalizer
    Cleanup(String, PostgresCluster),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

const CLUSTER_PATH: &str = "/apis/pgcluster.io/v1beta1/namespaces/testns/postgresclusters";

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    Response::builder()
        .status(status)
        .body(Body::from(bytes))
        .unwrap()
}

fn api_error(code: u16, reason: &str, message: &str) -> Response<Body> {
    json_response(
        StatusCode::from_u16(code).unwrap(),
        &serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }),
    )
}

fn running_pods(pod: Pod) -> ObjectList<Pod> {
    ObjectList {
        metadata: Default::default(),
        items: vec![pod],
        types: TypeMeta {
            kind: "PodList".to_string(),
            api_version: "v1".to_string(),
        },
    }
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
///
impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// This setup makes it easy to handle multiple requests by chaining handlers together.
    ///
    /// NB: If the controller is making more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the reconciler.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
    /// scenario runs to completion (i.e. all expected calls were responded to),
    /// using the timeout to catch missing api calls to Kubernetes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::FinalizerCreation(cluster) => {
                    self.handle_finalizer_creation(cluster).await
                }
                Scenario::RadioSilence => Ok(self),
                Scenario::MonitoringSecretCreate => self
                    .handle_secret_get(None)
                    .await
                    .unwrap()
                    .handle_secret_apply()
                    .await
                    .map(|(verifier, _)| verifier),
                Scenario::MonitoringSecretUpdate(secret) => self
                    .handle_secret_get(Some(secret))
                    .await
                    .unwrap()
                    .handle_secret_apply()
                    .await
                    .map(|(verifier, _)| verifier),
                Scenario::MonitoringSecretUnavailable => self.handle_secret_unavailable().await,
                Scenario::ExporterStatusPatch(cluster) => self
                    .handle_status_patch(cluster, |status| {
                        assert!(!status.monitoring.exporter_configuration.is_empty())
                    })
                    .await
                    .map(|(verifier, _)| verifier),
                Scenario::ExporterStatusConflict(resource_version) => {
                    self.handle_status_conflict(resource_version).await
                }
                Scenario::ReconcileWithoutMonitoring(cluster) => {
                    self.handle_reconcile_without_monitoring(cluster).await
                }
                Scenario::ReconcileWithMonitoring(cluster) => {
                    self.handle_reconcile_with_monitoring(cluster).await
                }
                Scenario::Cleanup(reason, cluster) => {
                    self.handle_namespace_status()
                        .await
                        .unwrap()
                        .handle_event_create(reason)
                        .await
                        .unwrap()
                        .handle_finalizer_removal(cluster)
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    // chainable scenario handlers
    async fn handle_finalizer_creation(
        mut self,
        cluster: PostgresCluster,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified document adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{CLUSTER_PATH}/{}", cluster.name_any())
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![PGCLUSTER_FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        send.send_response(json_response(StatusCode::OK, &cluster.finalized()));
        Ok(self)
    }

    async fn handle_finalizer_removal(
        mut self,
        cluster: PostgresCluster,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified document removing our finalizer (at index 0)
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{CLUSTER_PATH}/{}", cluster.name_any())
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers/0", "value": PGCLUSTER_FINALIZER },
            { "op": "remove", "path": "/metadata/finalizers/0" }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid cluster from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        // respond as the apiserver would have
        send.send_response(json_response(StatusCode::OK, &cluster));
        Ok(self)
    }

    async fn handle_namespace_status(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/testns/status");
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some("testns".to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NamespaceStatus {
                phase: Some("Active".to_string()),
                ..NamespaceStatus::default()
            }),
            ..Namespace::default()
        };
        send.send_response(json_response(StatusCode::OK, &namespace));
        Ok(self)
    }

    async fn handle_event_create(mut self, reason: String) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/events.k8s.io/v1/namespaces/testns/events"
        );
        // verify the event reason matches the expected
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let postdata: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid event from runtime");
        assert_eq!(
            postdata.get("reason").unwrap().as_str().map(String::from),
            Some(reason)
        );
        // then pass through the body
        send.send_response(Response::builder().body(Body::from(req_body.to_vec())).unwrap());
        Ok(self)
    }

    async fn handle_secret_get(mut self, existing: Option<Secret>) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/testns/secrets/testdb-monitoring"
        );
        let response = match existing {
            Some(secret) => json_response(StatusCode::OK, &secret),
            None => api_error(404, "NotFound", "secrets \"testdb-monitoring\" not found"),
        };
        send.send_response(response);
        Ok(self)
    }

    async fn handle_secret_unavailable(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(api_error(500, "InternalError", "etcdserver: request timed out"));
        Ok(self)
    }

    /// Echoes the applied secret and hands back its verifier
    async fn handle_secret_apply(mut self) -> Result<(Self, String), kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/testns/secrets/testdb-monitoring"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let secret: Secret = serde_json::from_slice(&req_body).expect("applied secret");
        let data = secret.data.clone().expect("secret data");
        assert_eq!(data["username"].0, b"ccp_monitoring");
        assert!(!data["password"].0.is_empty());
        let verifier = String::from_utf8(data["verifier"].0.clone()).expect("utf-8 verifier");
        assert!(verifier.starts_with("SCRAM-SHA-256$4096:"));
        assert_eq!(
            secret.labels().get("pgcluster.io/role").map(String::as_str),
            Some("monitoring")
        );
        send.send_response(json_response(StatusCode::OK, &secret));
        Ok((self, verifier))
    }

    async fn handle_configmap_apply(mut self, name: &str) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/testns/configmaps/{name}")
        );
        send.send_response(Response::builder().body(request.into_body()).unwrap());
        Ok(self)
    }

    async fn handle_statefulset_apply(
        mut self,
        name: &str,
        containers: &[&str],
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/apps/v1/namespaces/testns/statefulsets/{name}")
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let sts: serde_json::Value = serde_json::from_slice(&req_body).expect("applied sts");
        let names: Vec<&str> = sts["spec"]["template"]["spec"]["containers"]
            .as_array()
            .expect("containers")
            .iter()
            .filter_map(|c| c["name"].as_str())
            .collect();
        assert_eq!(names, containers);
        send.send_response(Response::builder().body(Body::from(req_body.to_vec())).unwrap());
        Ok(self)
    }

    async fn handle_pods_list(mut self, pod: Pod) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/testns/pods");
        assert!(request
            .uri()
            .query()
            .unwrap_or_default()
            .contains("labelSelector=pgcluster.io%2Fcluster%3Dtestdb"));
        send.send_response(json_response(StatusCode::OK, &running_pods(pod)));
        Ok(self)
    }

    /// Answers one status merge patch with the cluster carrying the patched
    /// status, after letting `check` inspect it
    async fn handle_status_patch(
        mut self,
        cluster: PostgresCluster,
        check: impl FnOnce(&PostgresClusterStatus),
    ) -> Result<(Self, PostgresCluster), kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{CLUSTER_PATH}/{}/status", cluster.name_any())
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("patch_status object is json");
        let patch = json.get("status").expect("status object").clone();
        // A patch from a cluster read at a known version must be conditional on it
        if let Some(rv) = cluster.resource_version() {
            assert_eq!(json["metadata"]["resourceVersion"], serde_json::json!(rv));
        }

        let mut merged = serde_json::to_value(cluster.status.clone().unwrap_or_default()).unwrap();
        if let (Some(merged), Some(patch)) = (merged.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                merged.insert(key.clone(), value.clone());
            }
        }
        let status: PostgresClusterStatus =
            serde_json::from_value(merged).expect("valid status");
        check(&status);

        let updated = cluster.with_status(status);
        send.send_response(json_response(StatusCode::OK, &updated));
        Ok((self, updated))
    }

    async fn handle_status_conflict(
        mut self,
        resource_version: String,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(request.uri().path(), format!("{CLUSTER_PATH}/testdb/status"));
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("patch_status object is json");
        assert_eq!(json["metadata"]["resourceVersion"], serde_json::json!(resource_version));
        assert!(json["status"]["monitoring"]["exporterConfiguration"]
            .as_str()
            .is_some_and(|f| !f.is_empty()));
        send.send_response(api_error(
            409,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version and try again",
        ));
        Ok(self)
    }

    async fn handle_instances_status(
        self,
        cluster: PostgresCluster,
    ) -> Result<Self, kube::Error> {
        self.handle_status_patch(cluster, |status| {
            assert_eq!(status.instances, vec!["testdb-00".to_string()])
        })
        .await
        .map(|(verifier, _)| verifier)
    }

    async fn handle_reconcile_without_monitoring(
        self,
        cluster: PostgresCluster,
    ) -> Result<Self, kube::Error> {
        let mut pod = primary_pod("testdb-00-0", &[("database", "image@sha123")]);
        pod.labels_mut()
            .insert(LABEL_INSTANCE.to_string(), "testdb-00".to_string());

        let (verifier, cluster) = self
            .handle_statefulset_apply("testdb-00", &["database"])
            .await?
            .handle_pods_list(pod)
            .await?
            .handle_status_patch(cluster, |status| {
                assert_eq!(status.monitoring.exporter_configuration.len(), 10)
            })
            .await?;
        verifier.handle_instances_status(cluster).await
    }

    async fn handle_reconcile_with_monitoring(
        self,
        cluster: PostgresCluster,
    ) -> Result<Self, kube::Error> {
        let mut pod = primary_pod(
            "testdb-00-0",
            &[("database", "image@sha123"), ("exporter", "image@sha123")],
        );
        pod.labels_mut()
            .insert(LABEL_INSTANCE.to_string(), "testdb-00".to_string());

        let (verifier, _) = self.handle_secret_get(None).await?.handle_secret_apply().await?;
        let (verifier, cluster) = verifier
            .handle_configmap_apply("testdb-exporter-queries-config")
            .await?
            .handle_statefulset_apply("testdb-00", &["database", "exporter"])
            .await?
            .handle_pods_list(pod)
            .await?
            .handle_status_patch(cluster, |status| {
                assert_eq!(status.monitoring.exporter_configuration.len(), 10)
            })
            .await?;
        verifier.handle_instances_status(cluster).await
    }
}

impl Context {
    // Create a test context with a mocked kube client, a recording exec, locally registered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier, Arc<RecordingPodExec>) {
        let exec = Arc::new(RecordingPodExec::default());
        let (ctx, verifier) = Self::test_with_exec(exec.clone());
        (ctx, verifier, exec)
    }

    pub fn test_with_exec(exec: Arc<RecordingPodExec>) -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let ctx = Self {
            client: mock_client,
            pod_exec: exec,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
