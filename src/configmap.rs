use crate::{
    apis::postgrescluster_types::PostgresCluster,
    naming::{FIELD_MANAGER, LABEL_CLUSTER},
    Error, Result,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use std::collections::BTreeMap;

use tracing::{debug, error};

/// Server-side apply a config map owned by the cluster
pub async fn apply_configmap(
    client: Client,
    cluster: &PostgresCluster,
    cm_name: &str,
    data: BTreeMap<String, String>,
) -> Result<ConfigMap> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
    let oref = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no uid".to_string()))?;
    let cm_api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(cm_name.to_string()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_CLUSTER.to_string(),
                cluster.name_any(),
            )])),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    let patch = Patch::Apply(&cm);

    match cm_api.patch(cm_name, &patch_params, &patch).await {
        Ok(o) => {
            debug!("Set configmap: {}", o.name_any());
            Ok(o)
        }
        Err(e) => {
            error!("Failed to set configmap {}: {}", cm_name, e);
            Err(Error::KubeError(e))
        }
    }
}
