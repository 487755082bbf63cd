use crate::{
    apis::postgrescluster_types::PostgresCluster,
    naming::{self, FIELD_MANAGER, LABEL_CLUSTER, LABEL_ROLE, MONITORING_USER, ROLE_MONITORING},
    Context, Error, Result,
};

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString};
use kube::{
    api::{Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use passwords::PasswordGenerator;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

pub const PASSWORD_KEY: &str = "password";
pub const VERIFIER_KEY: &str = "verifier";
pub const USERNAME_KEY: &str = "username";

const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SALT_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Make sure the exporter's credentials exist while monitoring is enabled.
///
/// Returns `None` without touching the API when monitoring is disabled.
/// An existing password is never replaced; only a missing verifier is
/// derived again. The secret is written with a single apply so a failed
/// write leaves nothing behind.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile_monitoring_secret(
    cluster: &PostgresCluster,
    ctx: Arc<Context>,
) -> Result<Option<Secret>> {
    if !cluster.exporter_enabled() {
        debug!("Monitoring disabled, no monitoring secret wanted");
        return Ok(None);
    }

    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no namespace".to_string()))?;
    let name = naming::monitoring_secret_name(cluster);
    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let oref = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidErr("PostgresCluster has no uid".to_string()))?;

    let existing = secret_api.get_opt(&name).await?;
    let data = monitoring_secret_data(existing.as_ref())?;

    let labels = BTreeMap::from([
        (LABEL_CLUSTER.to_owned(), cluster.name_any()),
        (LABEL_ROLE.to_owned(), ROLE_MONITORING.to_owned()),
    ]);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns),
            labels: Some(labels),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    };

    let ps = PatchParams::apply(FIELD_MANAGER).force();
    let applied = secret_api.patch(&name, &ps, &Patch::Apply(&secret)).await?;
    debug!("Applied monitoring secret {}", name);
    Ok(Some(applied))
}

/// Secret payload, reusing what an existing secret already holds
fn monitoring_secret_data(existing: Option<&Secret>) -> Result<BTreeMap<String, ByteString>> {
    let current = existing.and_then(|s| s.data.as_ref());
    let existing_password = current
        .and_then(|d| d.get(PASSWORD_KEY))
        .filter(|p| !p.0.is_empty());
    let password = match existing_password {
        Some(password) => password.0.clone(),
        None => generate_password()?.into_bytes(),
    };
    // A verifier is only trusted next to the password it came from
    let verifier = match (existing_password, current.and_then(|d| d.get(VERIFIER_KEY))) {
        (Some(_), Some(verifier)) if !verifier.0.is_empty() => verifier.0.clone(),
        _ => scram_sha256_verifier(&password, &random_salt())?.into_bytes(),
    };

    Ok(BTreeMap::from([
        (USERNAME_KEY.to_owned(), ByteString(MONITORING_USER.as_bytes().to_vec())),
        (PASSWORD_KEY.to_owned(), ByteString(password)),
        (VERIFIER_KEY.to_owned(), ByteString(verifier)),
    ]))
}

fn generate_password() -> Result<String> {
    let pg = PasswordGenerator {
        length: 24,
        numbers: true,
        lowercase_letters: true,
        uppercase_letters: true,
        symbols: false,
        spaces: false,
        exclude_similar_characters: false,
        strict: true,
    };
    pg.generate_one()
        .map_err(|e| Error::InvalidErr(format!("password generation failed: {e}")))
}

fn random_salt() -> [u8; SCRAM_SALT_LEN] {
    rand::thread_rng().gen()
}

/// PostgreSQL SCRAM-SHA-256 verifier of `password`, RFC 5802 / RFC 7677:
/// `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>`
pub fn scram_sha256_verifier(password: &[u8], salt: &[u8]) -> Result<String> {
    let salted = salted_password(password, salt, SCRAM_ITERATIONS)?;
    let client_key = hmac_sha256(&salted, b"Client Key")?;
    let stored_key = Sha256::digest(client_key);
    let server_key = hmac_sha256(&salted, b"Server Key")?;

    Ok(format!(
        "SCRAM-SHA-256${}:{}${}:{}",
        SCRAM_ITERATIONS,
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(stored_key),
        general_purpose::STANDARD.encode(server_key),
    ))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::InvalidErr(format!("hmac key: {e}")))?;
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

// Hi() from RFC 5802, i.e. PBKDF2 with HMAC-SHA-256 and a single block
fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32]> {
    let mut first = salt.to_vec();
    first.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac_sha256(password, &first)?;
    let mut result = u;
    for _ in 1..iterations {
        u = hmac_sha256(password, &u)?;
        result.iter_mut().zip(u.iter()).for_each(|(r, b)| *r ^= b);
    }
    Ok(result)
}
