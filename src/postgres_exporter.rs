use crate::{
    apis::postgrescluster_types::PostgresCluster,
    configmap::apply_configmap,
    naming::{
        self, EXPORTER_CERTS_PATH, EXPORTER_CERTS_VOLUME, EXPORTER_COMMAND, EXPORTER_CONFIG_PATH,
        EXPORTER_CONFIG_VOLUME, EXPORTER_CONTAINER, EXPORTER_DATABASE, EXPORTER_PORT,
        EXPORTER_PORT_NAME, EXPORTER_WEB_CONFIG_PATH, EXPORTER_WEB_CONFIG_VOLUME, MONITORING_USER,
    },
    secret::PASSWORD_KEY,
    Context, Result,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapProjection, ConfigMapVolumeSource, Container, ContainerPort,
    EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ProjectedVolumeSource, SecretKeySelector,
    SecurityContext, Volume, VolumeMount, VolumeProjection,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

pub const QUERIES_YAML: &str = "queries.yml";
pub const WEB_CONFIG_YAML: &str = "web-config.yml";
pub const WEB_CONFIG_DIR_ENV: &str = "WEB_CONFIG_DIR";

/// Queries for the exporter's `queries.yml`, keyed by metric namespace
pub type ExporterQueries = BTreeMap<String, ExporterQuery>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExporterQuery {
    pub query: String,
    /// Only run against the primary
    pub master: bool,
    /// One single-entry map per result column
    pub metrics: Vec<BTreeMap<String, QueryColumn>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryColumn {
    pub usage: ColumnUsage,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnUsage {
    Gauge,
    Label,
}

/// `web-config.yml` read by the exporter when serving over TLS
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WebConfig {
    pub tls_server_config: TlsServerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TlsServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

fn column(name: &str, usage: ColumnUsage, description: &str) -> BTreeMap<String, QueryColumn> {
    BTreeMap::from([(
        name.to_string(),
        QueryColumn {
            usage,
            description: description.to_string(),
        },
    )])
}

/// Queries mounted when the cluster does not bring its own exporter configuration
pub fn default_queries() -> ExporterQueries {
    BTreeMap::from([
        (
            "ccp_postmaster_uptime".to_string(),
            ExporterQuery {
                query: "SELECT extract(epoch from (clock_timestamp() - pg_postmaster_start_time())) AS seconds".to_string(),
                master: true,
                metrics: vec![column("seconds", ColumnUsage::Gauge, "Time since postmaster start")],
            },
        ),
        (
            "ccp_database_size".to_string(),
            ExporterQuery {
                query: "SELECT datname AS dbname, pg_database_size(datname) AS bytes FROM pg_catalog.pg_database WHERE datistemplate = false".to_string(),
                master: true,
                metrics: vec![
                    column("dbname", ColumnUsage::Label, "Database name"),
                    column("bytes", ColumnUsage::Gauge, "Database size in bytes"),
                ],
            },
        ),
        (
            "ccp_connection_stats".to_string(),
            ExporterQuery {
                query: "SELECT count(*) FILTER (WHERE state = 'active') AS active, count(*) FILTER (WHERE state = 'idle') AS idle, current_setting('max_connections')::bigint AS max_connections FROM pg_catalog.pg_stat_activity".to_string(),
                master: true,
                metrics: vec![
                    column("active", ColumnUsage::Gauge, "Active connections"),
                    column("idle", ColumnUsage::Gauge, "Idle connections"),
                    column("max_connections", ColumnUsage::Gauge, "Configured connection limit"),
                ],
            },
        ),
        (
            "ccp_is_in_recovery".to_string(),
            ExporterQuery {
                query: "SELECT CASE WHEN pg_is_in_recovery() THEN 1 ELSE 2 END AS status".to_string(),
                master: false,
                metrics: vec![column("status", ColumnUsage::Gauge, "1 for replica, 2 for primary")],
            },
        ),
    ])
}

/// Apply the default queries config map while the exporter is enabled and
/// has no configuration of its own.
#[instrument(skip(cluster, ctx))]
pub async fn reconcile_exporter_queries_config(
    cluster: &PostgresCluster,
    ctx: Arc<Context>,
) -> Result<Option<ConfigMap>> {
    match cluster.spec.exporter() {
        Some(exporter) if exporter.configuration.is_empty() => {
            let qdata = serde_yaml::to_string(&default_queries())?;
            let data = BTreeMap::from([(QUERIES_YAML.to_string(), qdata)]);
            let cm = apply_configmap(
                ctx.client.clone(),
                cluster,
                &naming::exporter_queries_config_map_name(cluster),
                data,
            )
            .await?;
            Ok(Some(cm))
        }
        _ => {
            debug!("No default exporter queries wanted");
            Ok(None)
        }
    }
}

/// Web configuration pointing the exporter at the mounted certificates,
/// only when a custom TLS secret is declared
pub fn exporter_web_config(cluster: &PostgresCluster) -> Option<WebConfig> {
    cluster
        .spec
        .exporter()
        .and_then(|e| e.custom_tls_secret.as_ref())
        .map(|_| WebConfig {
            tls_server_config: TlsServerConfig {
                cert_file: format!("{EXPORTER_CERTS_PATH}/tls.crt"),
                key_file: format!("{EXPORTER_CERTS_PATH}/tls.key"),
            },
        })
}

#[instrument(skip(cluster, ctx))]
pub async fn reconcile_exporter_web_config(
    cluster: &PostgresCluster,
    ctx: Arc<Context>,
) -> Result<Option<ConfigMap>> {
    let Some(web_config) = exporter_web_config(cluster) else {
        return Ok(None);
    };
    let data = BTreeMap::from([(
        WEB_CONFIG_YAML.to_string(),
        serde_yaml::to_string(&web_config)?,
    )]);
    let cm = apply_configmap(
        ctx.client.clone(),
        cluster,
        &naming::exporter_web_config_map_name(cluster),
        data,
    )
    .await?;
    Ok(Some(cm))
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

/// Replace the entry with the same name, or append it
fn upsert_by_name<T>(items: &mut Vec<T>, item: T, name: impl Fn(&T) -> &str) {
    match items.iter().position(|existing| name(existing) == name(&item)) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

/// Add the exporter sidecar and its configuration volume to an instance pod
/// template. Leaves the template untouched when monitoring is disabled.
///
/// Containers and volumes with other names are preserved; an existing
/// exporter container or config volume is replaced.
pub fn add_exporter_to_pod_spec(
    cluster: &PostgresCluster,
    template: &mut PodTemplateSpec,
    monitoring_secret: &str,
) -> Result<()> {
    let Some(exporter) = cluster.spec.exporter() else {
        return Ok(());
    };

    let env = vec![
        env("CONFIG_DIR", "/opt/cpm/conf"),
        env("POSTGRES_EXPORTER_PORT", EXPORTER_PORT.to_string()),
        env("PG_STAT_STATEMENTS_LIMIT", "20"),
        env("PG_STAT_STATEMENTS_THROTTLE_MINUTES", "-1"),
        env("EXPORTER_PG_HOST", "localhost"),
        env("EXPORTER_PG_PORT", cluster.spec.port.to_string()),
        env("EXPORTER_PG_DATABASE", EXPORTER_DATABASE),
        env("EXPORTER_PG_USER", MONITORING_USER),
        EnvVar {
            name: "EXPORTER_PG_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    key: PASSWORD_KEY.to_string(),
                    name: Some(monitoring_secret.to_string()),
                    optional: None,
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        },
    ];

    let container = Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(exporter.image.clone()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        resources: exporter.resources.clone(),
        command: Some(vec![EXPORTER_COMMAND.to_string()]),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: EXPORTER_PORT,
            name: Some(EXPORTER_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Capabilities::default()
            }),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: EXPORTER_CONFIG_VOLUME.to_string(),
            mount_path: EXPORTER_CONFIG_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };

    let sources = if exporter.configuration.is_empty() {
        vec![VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: Some(naming::exporter_queries_config_map_name(cluster)),
                ..ConfigMapProjection::default()
            }),
            ..VolumeProjection::default()
        }]
    } else {
        exporter.configuration.clone()
    };
    let config_volume = Volume {
        name: EXPORTER_CONFIG_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(sources),
            ..ProjectedVolumeSource::default()
        }),
        ..Volume::default()
    };

    let spec = template.spec.get_or_insert_with(PodSpec::default);
    upsert_by_name(&mut spec.containers, container, |c| c.name.as_str());
    upsert_by_name(
        spec.volumes.get_or_insert_with(Vec::new),
        config_volume,
        |v| v.name.as_str(),
    );
    Ok(())
}

/// Mount a custom TLS secret and the web configuration into the exporter.
///
/// No-op unless the exporter is enabled with a custom TLS secret. Existing
/// volumes, mounts and environment variables are kept; the TLS entries are
/// appended after them.
pub fn configure_exporter_tls(
    cluster: &PostgresCluster,
    template: &mut PodTemplateSpec,
    web_config: Option<&ConfigMap>,
) {
    let Some(tls_secret) = cluster
        .spec
        .exporter()
        .and_then(|e| e.custom_tls_secret.as_ref())
    else {
        return;
    };
    let web_config_name = web_config
        .and_then(|cm| cm.metadata.name.clone())
        .unwrap_or_else(|| naming::exporter_web_config_map_name(cluster));

    let spec = template.spec.get_or_insert_with(PodSpec::default);
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(Volume {
        name: EXPORTER_CERTS_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![VolumeProjection {
                secret: Some(tls_secret.clone()),
                ..VolumeProjection::default()
            }]),
            ..ProjectedVolumeSource::default()
        }),
        ..Volume::default()
    });
    volumes.push(Volume {
        name: EXPORTER_WEB_CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(web_config_name),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    });

    for container in spec
        .containers
        .iter_mut()
        .filter(|c| c.name == EXPORTER_CONTAINER)
    {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.push(VolumeMount {
            name: EXPORTER_CERTS_VOLUME.to_string(),
            mount_path: EXPORTER_CERTS_PATH.to_string(),
            ..VolumeMount::default()
        });
        mounts.push(VolumeMount {
            name: EXPORTER_WEB_CONFIG_VOLUME.to_string(),
            mount_path: EXPORTER_WEB_CONFIG_PATH.to_string(),
            ..VolumeMount::default()
        });
        container.env.get_or_insert_with(Vec::new).push(env(
            WEB_CONFIG_DIR_ENV,
            format!("{}/", EXPORTER_WEB_CONFIG_VOLUME),
        ));
    }
}
