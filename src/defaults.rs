use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity};
use std::collections::BTreeMap;

pub fn default_image() -> String {
    "quay.io/pgcluster/postgres:15.4".to_owned()
}

pub fn default_exporter_image() -> String {
    "quay.io/pgcluster/postgres-exporter:0.15.0".to_owned()
}

pub fn default_port() -> i32 {
    5432
}

pub fn default_instances() -> i32 {
    1
}

pub fn default_storage() -> Quantity {
    Quantity("8Gi".to_string())
}

pub fn default_resources() -> ResourceRequirements {
    let limits: BTreeMap<String, Quantity> = BTreeMap::from([
        ("cpu".to_owned(), Quantity("2".to_string())),
        ("memory".to_owned(), Quantity("2Gi".to_string())),
    ]);
    let requests: BTreeMap<String, Quantity> = BTreeMap::from([
        ("cpu".to_owned(), Quantity("500m".to_string())),
        ("memory".to_owned(), Quantity("512Mi".to_string())),
    ]);
    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..ResourceRequirements::default()
    }
}
