use k8s_openapi::{
    api::core::v1::{ResourceRequirements, SecretProjection, VolumeProjection},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Generate the Kubernetes wrapper struct `PostgresCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "PostgresCluster",
    group = "pgcluster.io",
    version = "v1beta1",
    namespaced
)]
#[kube(status = "PostgresClusterStatus", shortname = "pgc")]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    #[serde(default = "defaults::default_image")]
    pub image: String,

    pub image_pull_policy: Option<String>,

    #[serde(default = "defaults::default_port")]
    pub port: i32,

    #[serde(default = "defaults::default_instances")]
    pub instances: i32,

    #[serde(default = "defaults::default_resources")]
    pub resources: ResourceRequirements,

    #[serde(default = "defaults::default_storage")]
    pub storage: Quantity,

    /// Metrics collection for the cluster. Present means enabled.
    pub monitoring: Option<MonitoringSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    pub exporter: Option<ExporterSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    #[serde(default = "defaults::default_exporter_image")]
    pub image: String,

    pub resources: Option<ResourceRequirements>,

    /// Extra files for the exporter's configuration directory. When empty the
    /// operator-managed default queries are mounted instead.
    #[serde(default)]
    pub configuration: Vec<VolumeProjection>,

    /// Secret holding `tls.crt` and `tls.key` served by the exporter
    #[serde(rename = "customTLSSecret")]
    pub custom_tls_secret: Option<SecretProjection>,
}

/// The status object of `PostgresCluster`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    #[serde(default)]
    pub monitoring: MonitoringStatus,

    /// Instances seen on the last reconcile pass
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    /// Fingerprint of the exporter setup last applied in the database.
    /// Opaque; compared by equality only.
    #[serde(default)]
    pub exporter_configuration: String,
}

impl PostgresClusterSpec {
    /// The exporter sidecar is wanted whenever an exporter is declared
    pub fn exporter(&self) -> Option<&ExporterSpec> {
        self.monitoring.as_ref().and_then(|m| m.exporter.as_ref())
    }
}

impl PostgresCluster {
    pub fn exporter_enabled(&self) -> bool {
        self.spec.exporter().is_some()
    }

    pub fn exporter_configuration(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.monitoring.exporter_configuration.as_str())
            .unwrap_or_default()
    }
}
