//! vLLM backend: drives a remote OpenAI-compatible inference server.
//!
//! This backend is inference-only. Training and deployment requests fail
//! deterministically; model listing and streamed chat completions are the
//! supported surface.

use std::io;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Backend, BackendError, ChunkSender, ProgressSender, TrainingArtifact};
use crate::config::VllmRuntime;
use crate::model::{TrainedModel, TrainingJob};

/// Served when the vLLM server is unreachable.
const FALLBACK_MODELS: &[&str] = &[
    "llama3.1-8b",
    "llama3.1-70b",
    "phi3-mini",
    "codellama-7b",
    "mistral-7b",
    "gemma-7b",
    "qwen2-7b",
];

const MAX_COMPLETION_TOKENS: u32 = 256;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

pub struct VllmBackend {
    client: Client,
    runtime: VllmRuntime,
}

impl VllmBackend {
    pub fn from_env() -> Result<Self> {
        Self::new(VllmRuntime::from_env())
    }

    pub fn new(runtime: VllmRuntime) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { client, runtime })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.runtime.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Backend for VllmBackend {
    fn name(&self) -> &'static str {
        "vllm"
    }

    async fn start_training(
        &self,
        _job: TrainingJob,
        _progress: ProgressSender,
        _cancel: CancellationToken,
    ) -> Result<TrainingArtifact, BackendError> {
        Err(BackendError::NotSupported(
            "the vLLM backend is inference-only; training is not supported".into(),
        ))
    }

    async fn test_model_stream(
        &self,
        model: &TrainedModel,
        prompt: &str,
        chunks: ChunkSender,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .json(&serde_json::json!({
                "model": model.name,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": MAX_COMPLETION_TOKENS,
                "stream": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                500..=599 => {
                    BackendError::ServerError(format!("server error ({status}): {body}"))
                }
                _ => BackendError::RequestFailed(format!("request failed ({status}): {body}")),
            });
        }

        // SSE framing: `data: {json}` lines, ended by `data: [DONE]`.
        let byte_stream = response.bytes_stream().map_err(io::Error::other);
        let mut lines = FramedRead::new(StreamReader::new(byte_stream), LinesCodec::new());

        while let Some(line) = lines.next().await {
            let line = line
                .map_err(|e| BackendError::RequestFailed(format!("stream read error: {e}")))?;
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break;
            }
            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("skipping unparseable stream chunk: {e}");
                    continue;
                }
            };
            if let Some(content) = chunk.choices.first().and_then(|c| c.delta.content.clone()) {
                if chunks.send(content).is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn available_models(&self) -> Vec<String> {
        let result = async {
            let response = self.client.get(self.endpoint("/v1/models")).send().await?;
            if !response.status().is_success() {
                return Err(BackendError::ServerError(format!(
                    "listing models failed with status {}",
                    response.status()
                )));
            }
            let models: ModelsResponse = response
                .json()
                .await
                .map_err(|e| BackendError::RequestFailed(format!("invalid models response: {e}")))?;
            Ok(models.data.into_iter().map(|m| m.id).collect::<Vec<_>>())
        }
        .await;

        match result {
            Ok(models) => models,
            Err(e) => {
                warn!("vLLM not reachable, serving fallback catalog: {e}");
                FALLBACK_MODELS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    async fn deploy_model(&self, _model: &TrainedModel) -> Result<String, BackendError> {
        Err(BackendError::NotSupported(
            "the vLLM backend is inference-only; deployment is not supported".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let backend = VllmBackend::new(VllmRuntime {
            base_url: "http://localhost:8000/".into(),
        })
        .unwrap();
        assert_eq!(
            backend.endpoint("/v1/models"),
            "http://localhost:8000/v1/models"
        );
    }
}
