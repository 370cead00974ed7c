//! Crate-wide error type.
//!
//! Lower layers return these instead of aborting; only the suite driver decides
//! whether an error ends a single case or the whole run.

use crate::config::ConfigError;
use crate::session::CleanupError;
use crate::verify::VerificationError;
use crate::wait::WaitError;
use thiserror::Error;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shared fixtures could not be created; nothing after this can run.
    #[error("Suite setup failed: {0}")]
    Setup(String),

    #[error("Cluster {name} was rejected by the control plane: {source}")]
    ClusterRejected {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Join command for cluster {cluster} is unavailable: {reason}")]
    JoinCommandUnavailable { cluster: String, reason: String },

    #[error("Failed to launch simulated node in {namespace}: {reason}")]
    Launch { namespace: String, reason: String },

    #[error("Credential creation failed for {provider}: {reason}")]
    Credential { provider: String, reason: String },

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// The body failed and the session drain that followed failed as well.
    #[error("{primary} (cleanup also failed: {cleanup})")]
    CleanupAfterFailure {
        primary: Box<HarnessError>,
        cleanup: CleanupError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing field {field} on {kind}/{name}")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },
}
