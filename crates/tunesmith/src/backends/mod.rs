//! Pluggable model-execution backends.
//!
//! Each backend implements the same capability surface, so the
//! orchestrator only branches on framework once, at selection time.
//! Variants differ in how they produce training progress: `ollama` parses
//! percentage markers from subprocess output, `vllm` drives a remote HTTP
//! API, `transformers` parses structured progress lines from a local
//! training script.

pub mod errors;
pub mod factory;
pub mod ollama;
pub mod transformers;
pub mod vllm;

pub use errors::BackendError;
pub use factory::stock_backends;
pub use ollama::OllamaBackend;
pub use transformers::TransformersBackend;
pub use vllm::VllmBackend;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{TrainedModel, TrainingJob};
use crate::progress::ProgressUpdate;

/// Artifact produced by a successful training run.
#[derive(Debug, Clone)]
pub struct TrainingArtifact {
    /// Backend-specific locator: a filesystem path or a backend-native
    /// model name, sufficient to build a [`TrainedModel`] record.
    pub locator: String,
    /// Best-effort size in bytes.
    pub size: Option<u64>,
}

/// Sender half for training progress ticks.
pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Sender half for streamed inference output.
pub type ChunkSender = mpsc::UnboundedSender<String>;

/// Uniform capability surface over a model-execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run a fine-tuning job to completion.
    ///
    /// Emits zero or more progress ticks through `progress` before
    /// settling. Cancellation is cooperative: when `cancel` fires the
    /// backend halts resource use (kills its subprocess, stops its timer)
    /// and settles with [`BackendError::Cancelled`] within bounded time.
    async fn start_training(
        &self,
        job: TrainingJob,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<TrainingArtifact, BackendError>;

    /// Stream inference output for a prompt against a trained model.
    /// Fragments are pushed through `chunks` as they become available;
    /// returns only after the underlying response stream is exhausted.
    async fn test_model_stream(
        &self,
        model: &TrainedModel,
        prompt: &str,
        chunks: ChunkSender,
    ) -> Result<(), BackendError>;

    /// List base models this backend can work with. Never fails outward:
    /// when the backend is unreachable, a static fallback catalog is
    /// returned instead.
    async fn available_models(&self) -> Vec<String>;

    /// Make a trained model reachable for inference and return its
    /// endpoint. Backends without deployment support fail with a
    /// deterministic [`BackendError::NotSupported`].
    async fn deploy_model(&self, model: &TrainedModel) -> Result<String, BackendError>;
}
