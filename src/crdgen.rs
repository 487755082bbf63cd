use controller::apis::postgrescluster_types::PostgresCluster;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let mut crd = PostgresCluster::crd();

    // Keep the CRD (and every cluster with it) when the chart is uninstalled
    crd.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert("helm.sh/resource-policy".to_string(), "keep".to_string());

    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
