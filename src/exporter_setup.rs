//! Keeps the exporter's in-database setup in line with the cluster spec.
//!
//! The setup is applied through `psql` in the primary's database container
//! and is only re-applied when the fingerprint of the wanted setup differs
//! from the one recorded in `status.monitoring.exporterConfiguration`.
use crate::{
    apis::postgrescluster_types::PostgresCluster,
    controller::patch_cluster_status_merge,
    instances::{NotReady, ObservedInstances},
    naming::{DATABASE_CONTAINER, EXPORTER_DATABASE, MONITORING_USER},
    secret::VERIFIER_KEY,
    Context, Error, Result,
};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

const FINGERPRINT_DOMAIN: &str = "pgcluster.io/exporter-setup/v1";
const FINGERPRINT_BYTES: usize = 5;

/// What the database should look like for the exporter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExporterSetup {
    /// Monitoring role can log in with the given SCRAM verifier
    Install { verifier: String },
    /// Monitoring role, if any, can no longer log in
    Uninstall,
}

/// Result of one convergence pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupOutcome {
    /// No pod is safe to exec into; nothing was attempted
    Deferred(NotReady),
    /// Recorded fingerprint already matches
    Converged,
    /// Setup was applied and the new fingerprint recorded
    Applied(String),
}

impl ExporterSetup {
    /// The wanted setup, taking the verifier from the monitoring secret
    /// while monitoring is enabled.
    pub fn desired(cluster: &PostgresCluster, secret: Option<&Secret>) -> Result<Self> {
        if !cluster.exporter_enabled() {
            return Ok(ExporterSetup::Uninstall);
        }
        let secret = secret.ok_or_else(|| {
            Error::MissingSecretError(format!(
                "monitoring secret for {} not available",
                cluster.name_any()
            ))
        })?;
        let verifier = secret
            .data
            .as_ref()
            .and_then(|d| d.get(VERIFIER_KEY))
            .filter(|v| !v.0.is_empty())
            .ok_or_else(|| {
                Error::MissingSecretError(format!(
                    "secret {} has no {VERIFIER_KEY}",
                    secret.name_any()
                ))
            })?;
        let verifier = String::from_utf8(verifier.0.clone())
            .map_err(|_| Error::InvalidErr(format!("{VERIFIER_KEY} is not valid UTF-8")))?;
        Ok(ExporterSetup::Install { verifier })
    }

    pub fn action(&self) -> &'static str {
        match self {
            ExporterSetup::Install { .. } => "install",
            ExporterSetup::Uninstall => "uninstall",
        }
    }

    pub fn sql(&self) -> String {
        match self {
            ExporterSetup::Install { verifier } => setup_sql(MONITORING_USER, verifier),
            ExporterSetup::Uninstall => disable_sql(MONITORING_USER),
        }
    }

    /// Short hex digest over everything that shapes the applied SQL.
    ///
    /// Each field is hashed with a length prefix so that no two field lists
    /// share a byte stream. Only ever compared for equality.
    pub fn fingerprint(&self) -> String {
        let enabled: &[u8] = match self {
            ExporterSetup::Install { .. } => b"enabled",
            ExporterSetup::Uninstall => b"disabled",
        };
        let sql = self.sql();
        let mut hasher = Sha256::new();
        for field in [
            FINGERPRINT_DOMAIN.as_bytes(),
            enabled,
            EXPORTER_DATABASE.as_bytes(),
            sql.as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.finalize()[..FINGERPRINT_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// `psql` invocation run inside the database container
    pub fn psql_command(&self) -> Vec<String> {
        vec![
            "psql".to_string(),
            format!("postgres://?dbname={EXPORTER_DATABASE}&application_name=pgcluster-operator"),
            "--no-psqlrc".to_string(),
            "--quiet".to_string(),
            "--set=ON_ERROR_STOP=1".to_string(),
            "--command".to_string(),
            self.sql(),
        ]
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn setup_sql(user: &str, verifier: &str) -> String {
    let role = quote_ident(user);
    let name = quote_literal(user);
    let verifier = quote_literal(verifier);
    format!(
        r#"SET search_path TO pg_catalog;
DO $$
BEGIN
  IF NOT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN
    CREATE ROLE {role};
  END IF;
END
$$;
ALTER ROLE {role} WITH LOGIN NOSUPERUSER NOCREATEDB NOCREATEROLE PASSWORD {verifier};
GRANT pg_monitor TO {role};
ALTER ROLE {role} SET lock_timeout TO '2min';
ALTER ROLE {role} SET jit TO 'off';
"#
    )
}

fn disable_sql(user: &str) -> String {
    let role = quote_ident(user);
    let name = quote_literal(user);
    format!(
        r#"SET search_path TO pg_catalog;
DO $$
BEGIN
  IF EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN
    ALTER ROLE {role} WITH NOLOGIN PASSWORD NULL;
  END IF;
END
$$;
"#
    )
}

/// Install, update or remove the exporter's database setup when it has
/// drifted from the spec.
///
/// Skips quietly when the primary is not safe to exec into. An exec failure
/// is returned as is and leaves the recorded fingerprint untouched, so the
/// next pass tries again.
#[instrument(skip_all, fields(cluster = %cluster.name_any()))]
pub async fn reconcile_exporter_setup(
    cluster: &PostgresCluster,
    ctx: Arc<Context>,
    observed: &ObservedInstances,
    secret: Option<&Secret>,
) -> Result<SetupOutcome> {
    let target = match observed.primary_target(cluster.exporter_enabled()) {
        Ok(target) => target,
        Err(reason) => {
            info!("Deferring exporter setup: {}", reason);
            return Ok(SetupOutcome::Deferred(reason));
        }
    };

    let setup = ExporterSetup::desired(cluster, secret)?;
    let fingerprint = setup.fingerprint();
    if fingerprint == cluster.exporter_configuration() {
        debug!("Exporter setup up to date ({})", fingerprint);
        return Ok(SetupOutcome::Converged);
    }

    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
    let pod = target.pod_name();
    info!(
        "Applying exporter {} on {} (fingerprint {} -> {})",
        setup.action(),
        pod,
        cluster.exporter_configuration(),
        fingerprint
    );
    if let Err(e) = ctx
        .pod_exec
        .exec(&ns, &pod, DATABASE_CONTAINER, None, &setup.psql_command())
        .await
    {
        error!("Exporter {} failed on {}: {}", setup.action(), pod, e);
        return Err(e);
    }

    let mut patch = json!({
        "status": { "monitoring": { "exporterConfiguration": fingerprint } }
    });
    if let Some(rv) = cluster.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &ns);
    patch_cluster_status_merge(&clusters, &cluster.name_any(), patch).await?;
    ctx.metrics.exporter_setup_applied(setup.action());
    Ok(SetupOutcome::Applied(fingerprint))
}
