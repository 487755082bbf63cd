//! Fixed names shared by the pod template builders and the reconcilers.
use crate::apis::postgrescluster_types::PostgresCluster;
use kube::ResourceExt;

pub const DATABASE_CONTAINER: &str = "database";
pub const EXPORTER_CONTAINER: &str = "exporter";

pub const EXPORTER_PORT: i32 = 9187;
pub const EXPORTER_PORT_NAME: &str = "exporter";
pub const EXPORTER_COMMAND: &str = "/opt/cpm/bin/start.sh";

pub const EXPORTER_CONFIG_VOLUME: &str = "exporter-config";
pub const EXPORTER_CONFIG_PATH: &str = "/conf";
pub const EXPORTER_CERTS_VOLUME: &str = "exporter-certs";
pub const EXPORTER_CERTS_PATH: &str = "/certs";
pub const EXPORTER_WEB_CONFIG_VOLUME: &str = "web-config";
pub const EXPORTER_WEB_CONFIG_PATH: &str = "/web-config";

pub const DATA_VOLUME: &str = "postgres-data";
pub const DATA_PATH: &str = "/pgdata";

/// Role the exporter logs in as
pub const MONITORING_USER: &str = "ccp_monitoring";
/// Database the exporter connects to and the setup SQL runs in
pub const EXPORTER_DATABASE: &str = "postgres";

pub const LABEL_CLUSTER: &str = "pgcluster.io/cluster";
pub const LABEL_INSTANCE: &str = "pgcluster.io/instance";
pub const LABEL_ROLE: &str = "pgcluster.io/role";
pub const ROLE_MONITORING: &str = "monitoring";

/// Pod annotation maintained by the HA agent, e.g. `{"role":"master"}`
pub const ROLE_ANNOTATION: &str = "status";

pub const FIELD_MANAGER: &str = "cntrlr";

pub fn monitoring_secret_name(cluster: &PostgresCluster) -> String {
    format!("{}-monitoring", cluster.name_any())
}

pub fn exporter_web_config_map_name(cluster: &PostgresCluster) -> String {
    format!("{}-exporter-web-config", cluster.name_any())
}

pub fn exporter_queries_config_map_name(cluster: &PostgresCluster) -> String {
    format!("{}-exporter-queries-config", cluster.name_any())
}

pub fn instance_name(cluster: &PostgresCluster, ordinal: i32) -> String {
    format!("{}-{:02}", cluster.name_any(), ordinal)
}

pub fn cluster_selector(cluster: &PostgresCluster) -> String {
    format!("{}={}", LABEL_CLUSTER, cluster.name_any())
}
