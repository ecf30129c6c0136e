use thiserror::Error;

use crate::backends::BackendError;
use crate::registry::RegistryError;

/// Errors surfaced by orchestration operations.
///
/// Training failures never appear here: they are converted into persisted
/// terminal job state at the orchestrator boundary. What remains is
/// synchronous rejection (validation, unknown framework), lookup failures,
/// and inference/deployment errors passed through from a backend.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported framework: {0}")]
    UnknownFramework(String),

    #[error("trained model {0} not found")]
    ModelNotFound(i64),

    #[error("job '{0}' already has a live training run")]
    AlreadyRunning(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Storage(err)
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRunning(id) => OrchestratorError::AlreadyRunning(id),
        }
    }
}
