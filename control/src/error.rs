use common::{KeyError, ResourceKey};
use thiserror::Error;

/// cflb Control Plane Errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Invalid resource key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Service {key} cannot be exposed: {reason}")]
    InvalidService { key: ResourceKey, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to render tunnel configuration: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("Failed to replace tunnel configuration: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl ControllerError {
    /// Whether another attempt at the same key could succeed
    ///
    /// A malformed key stays malformed, everything else goes through the
    /// queue's backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ControllerError::InvalidKey(_))
    }
}
