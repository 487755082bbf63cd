use crate::{
    apis::postgrescluster_types::PostgresCluster,
    naming::{
        self, DATABASE_CONTAINER, DATA_PATH, DATA_VOLUME, FIELD_MANAGER, LABEL_CLUSTER,
        LABEL_INSTANCE,
    },
    postgres_exporter::{add_exporter_to_pod_spec, configure_exporter_tls},
    Context, Error, Result,
};
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            ConfigMap, Container, ContainerPort, EnvVar, ExecAction, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
            SecurityContext, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Resource,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

/// Desired StatefulSet for the instance at `ordinal`.
///
/// The pod template starts with the database container and is then passed
/// through the exporter composer and the TLS augmenter.
pub fn stateful_set_from_cluster(
    cluster: &PostgresCluster,
    ordinal: i32,
    web_config: Option<&ConfigMap>,
) -> Result<StatefulSet> {
    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
    let oref = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no uid".to_string()))?;
    let name = naming::instance_name(cluster, ordinal);

    let labels = BTreeMap::from([
        (LABEL_CLUSTER.to_owned(), cluster.name_any()),
        (LABEL_INSTANCE.to_owned(), name.clone()),
    ]);

    let database = Container {
        name: DATABASE_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        resources: Some(cluster.spec.resources.clone()),
        env: Some(vec![
            EnvVar {
                name: "PGDATA".to_string(),
                value: Some(format!("{DATA_PATH}/pg")),
                ..EnvVar::default()
            },
            EnvVar {
                name: "PGPORT".to_string(),
                value: Some(cluster.spec.port.to_string()),
                ..EnvVar::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            container_port: cluster.spec.port,
            name: Some("postgres".to_string()),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_PATH.to_string(),
            ..VolumeMount::default()
        }]),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![String::from("pg_isready")]),
            }),
            initial_delay_seconds: Some(3),
            ..Probe::default()
        }),
        ..Container::default()
    };

    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![database],
            ..PodSpec::default()
        }),
    };
    add_exporter_to_pod_spec(cluster, &mut template, &naming::monitoring_secret_name(cluster))?;
    configure_exporter_tls(cluster, &mut template, web_config);

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: name,
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(labels),
            },
            template,
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    ..ObjectMeta::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            cluster.spec.storage.clone(),
                        )])),
                        ..ResourceRequirements::default()
                    }),
                    ..PersistentVolumeClaimSpec::default()
                }),
                status: None,
            }]),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    })
}

/// Apply one StatefulSet per declared instance
#[instrument(skip(cluster, ctx, web_config), fields(cluster = %cluster.name_any()))]
pub async fn reconcile_instances(
    cluster: &PostgresCluster,
    ctx: Arc<Context>,
    web_config: Option<&ConfigMap>,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    let ps = PatchParams::apply(FIELD_MANAGER).force();

    for ordinal in 0..cluster.spec.instances.max(0) {
        let sts = stateful_set_from_cluster(cluster, ordinal, web_config)?;
        let name = sts.name_any();
        sts_api
            .patch(&name, &ps, &Patch::Apply(&sts))
            .await
            .map_err(Error::KubeError)?;
        debug!("Applied instance StatefulSet {}", name);
    }
    Ok(())
}
