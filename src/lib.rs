/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
pub mod config;
pub mod configmap;
pub mod defaults;
pub mod exec;
pub mod exporter_setup;
#[cfg(test)]
pub mod fixtures;
pub mod instances;
pub mod naming;
pub mod postgres_exporter;
pub mod secret;
pub mod statefulset;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An error occurred in kube-exec: {0}")]
    KubeExecError(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("SerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),

    #[error("Status update conflict for {0}")]
    StatusConflict(String),

    #[error("Invalid Data: {0}")]
    InvalidErr(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Bounded label for the failure counter; never carries error details
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeExecError(_) => "kube_exec",
            Error::SerializationError(_) => "serialization",
            Error::YamlSerializationError(_) => "yaml_serialization",
            Error::KubeError(_) => "kube",
            Error::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.metric_label(),
                _ => "finalizer",
            },
            Error::MissingSecretError(_) => "missing_secret",
            Error::StatusConflict(_) => "status_conflict",
            Error::InvalidErr(_) => "invalid",
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlSerializationError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err)
    }
}
