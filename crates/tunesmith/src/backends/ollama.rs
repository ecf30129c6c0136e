//! Ollama backend: fine-tunes by building a Modelfile and driving
//! `ollama create` as a subprocess, serves inference from the local
//! Ollama HTTP API.

use std::io;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use indoc::formatdoc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{Backend, BackendError, ChunkSender, ProgressSender, TrainingArtifact};
use crate::config::OllamaRuntime;
use crate::dataset::{self, TrainingExample};
use crate::model::{TrainedModel, TrainingJob};
use crate::progress::ProgressUpdate;

/// Served when the local Ollama instance is unreachable.
const FALLBACK_MODELS: &[&str] = &[
    "llama3.1:8b",
    "llama3.1:70b",
    "phi3:mini",
    "codellama:7b",
    "mistral:7b",
    "gemma:7b",
    "llama2:13b",
];

/// Popular base models available for pulling.
const BASE_MODEL_CATALOG: &[&str] = &[
    "llama3.1:8b",
    "llama3.1:70b",
    "llama3.2:3b",
    "phi3:mini",
    "phi3:medium",
    "codellama:7b",
    "codellama:13b",
    "mistral:7b",
    "gemma:7b",
    "gemma2:9b",
    "qwen2:7b",
    "deepseek-coder:6.7b",
    "llama2:7b",
    "llama2:13b",
];

/// `ollama create` reports progress as lines like `transferring 45%`,
/// on stdout or stderr depending on version.
static PERCENT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<verb>\w+)\s+(?P<pct>\d+)%").unwrap());

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

pub struct OllamaBackend {
    client: Client,
    runtime: OllamaRuntime,
}

impl OllamaBackend {
    pub fn from_env() -> Result<Self> {
        Self::new(OllamaRuntime::from_env())
    }

    pub fn new(runtime: OllamaRuntime) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { client, runtime })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.runtime.base_url()?.join(path).map_err(|e| {
            BackendError::RequestFailed(format!("failed to construct endpoint URL: {e}"))
        })
    }

    /// Fail early with a readable message when Ollama is not running.
    async fn check_connection(&self) -> Result<(), BackendError> {
        let url = self.endpoint("api/tags")?;
        self.client.get(url).send().await.map_err(|_| {
            BackendError::ConnectionFailed(format!(
                "cannot connect to Ollama at {}; make sure Ollama is running",
                self.runtime.host
            ))
        })?;
        Ok(())
    }

    async fn list_local_models(&self) -> Result<Vec<OllamaModel>, BackendError> {
        let url = self.endpoint("api/tags")?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::ServerError(format!(
                "listing models failed with status {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::RequestFailed(format!("invalid tags response: {e}")))?;
        Ok(tags.models)
    }

    /// Pick the next free `<base>-<n>` name among the locally installed
    /// models.
    async fn next_model_name(&self, base_model: &str) -> Result<String, BackendError> {
        let models = self.list_local_models().await?;
        let names: Vec<String> = models.into_iter().map(|m| m.name).collect();
        let index = next_model_index(&names, base_model);
        Ok(format!("{base_model}-{index}"))
    }

    async fn model_size(&self, model_name: &str) -> Option<u64> {
        match self.list_local_models().await {
            Ok(models) => models
                .into_iter()
                .find(|m| m.name == model_name)
                .and_then(|m| m.size),
            Err(e) => {
                debug!("failed to look up model size: {e}");
                None
            }
        }
    }

    /// Run `ollama create` and relay its percentage markers as progress
    /// ticks.
    async fn create_model(
        &self,
        model_name: &str,
        modelfile: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let dir = tempfile::tempdir()
            .map_err(|e| BackendError::ExecutionError(format!("failed to create temp dir: {e}")))?;
        let modelfile_path = dir.path().join("Modelfile");
        tokio::fs::write(&modelfile_path, modelfile).await?;

        let mut cmd = Command::new("ollama");
        cmd.arg("create")
            .arg(model_name)
            .arg("-f")
            .arg(&modelfile_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::ProcessFailed(format!("failed to spawn `ollama create`: {e}"))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let status = {
            let pump = async {
                tokio::join!(
                    pump_percent_markers(stdout, progress.clone()),
                    pump_percent_markers(stderr, progress.clone()),
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                status = async {
                    pump.await;
                    child.wait().await
                } => Some(status),
            }
        };

        let Some(status) = status else {
            child.kill().await.ok();
            return Err(BackendError::Cancelled);
        };
        let status = status
            .map_err(|e| BackendError::ProcessFailed(format!("failed to wait for ollama: {e}")))?;

        if !status.success() {
            return Err(BackendError::ProcessFailed(format!(
                "`ollama create` exited with {status}"
            )));
        }
        Ok(())
    }

    /// Pull a base model if it is not installed yet.
    pub async fn pull_model(&self, model_name: &str) -> Result<(), BackendError> {
        let installed = self.list_local_models().await?;
        if installed.iter().any(|m| m.name == model_name) {
            return Ok(());
        }

        info!("pulling model {model_name}");
        let url = self.endpoint("api/pull")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "model": model_name, "stream": false }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::ServerError(format!(
                "failed to pull model {model_name}: status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Remove a model from the local Ollama instance.
    pub async fn delete_model(&self, model_name: &str) -> Result<(), BackendError> {
        let url = self.endpoint("api/delete")?;
        let response = self
            .client
            .delete(url)
            .json(&serde_json::json!({ "model": model_name }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::ServerError(format!(
                "failed to delete model {model_name}: status {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub fn base_model_catalog() -> &'static [&'static str] {
        BASE_MODEL_CATALOG
    }
}

/// Relay `<verb> NN%` lines as progress ticks; everything else goes to the
/// debug log.
async fn pump_percent_markers(reader: Option<impl AsyncRead + Unpin>, progress: ProgressSender) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(caps) = PERCENT_MARKER.captures(&line) {
            let verb = &caps["verb"];
            let pct: f32 = caps["pct"].parse().unwrap_or(0.0);
            // Model creation has no epochs; only the percentage moves.
            let _ = progress.send(ProgressUpdate {
                progress: pct,
                current_epoch: 0,
                loss: None,
                status: Some(format!("{verb} {pct}%")),
            });
        } else if !line.trim().is_empty() {
            debug!(target: "ollama", "{line}");
        }
    }
}

fn next_model_index(installed: &[String], base_model: &str) -> u32 {
    let pattern = format!("^{}-(\\d+)$", regex::escape(base_model));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return 1,
    };
    let max = installed
        .iter()
        .filter_map(|name| re.captures(name))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    max + 1
}

fn build_modelfile(job: &TrainingJob, examples: &[TrainingExample]) -> String {
    let system_prompt = job
        .system_prompt
        .as_deref()
        .unwrap_or("You are a helpful AI assistant that has been fine-tuned on custom data.");

    let formatted: Vec<String> = examples
        .iter()
        .map(|example| format!("Q: {}\nA: {}", example.prompt, example.response))
        .collect();
    // Embedded as comments: `ollama create` does not take raw examples,
    // the pairs ride along for inspection and reproducibility.
    let examples_block = formatted
        .join("\n\n---\n\n")
        .lines()
        .map(|line| format!("# {line}"))
        .collect::<Vec<_>>()
        .join("\n");

    formatdoc! {r#"
        FROM {base_model}

        SYSTEM "{system_prompt}"

        PARAMETER temperature 0.7
        PARAMETER top_p 0.9
        PARAMETER top_k 40
        PARAMETER num_ctx {context_length}
        PARAMETER num_predict 512
        PARAMETER repeat_penalty 1.1
        PARAMETER num_batch {batch_size}

        TEMPLATE """{{{{ if .System }}}}<|system|>
        {{{{ .System }}}}<|end|>
        {{{{ end }}}}{{{{ if .Prompt }}}}<|user|>
        {{{{ .Prompt }}}}<|end|>
        <|assistant|>
        {{{{ end }}}}"""

        # Training examples:
        {examples_block}
    "#,
        base_model = job.base_model,
        system_prompt = system_prompt,
        context_length = job.context_length,
        batch_size = job.batch_size,
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn start_training(
        &self,
        job: TrainingJob,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<TrainingArtifact, BackendError> {
        self.check_connection().await?;

        let dataset_path = job
            .dataset_path
            .as_deref()
            .ok_or_else(|| BackendError::ExecutionError("job has no dataset path".into()))?;
        let examples = dataset::load_examples(dataset_path).await?;
        info!(
            job = %job.public_job_id,
            examples = examples.len(),
            "building Modelfile from dataset"
        );

        let modelfile = build_modelfile(&job, &examples);
        let model_name = self.next_model_name(&job.base_model).await?;

        self.create_model(&model_name, &modelfile, &progress, &cancel)
            .await?;

        let _ = progress.send(ProgressUpdate {
            progress: 100.0,
            current_epoch: 0,
            loss: None,
            status: Some("model creation completed".into()),
        });

        let size = self.model_size(&model_name).await;
        // The model lives inside Ollama; its name is the artifact locator.
        Ok(TrainingArtifact {
            locator: model_name,
            size,
        })
    }

    async fn test_model_stream(
        &self,
        model: &TrainedModel,
        prompt: &str,
        chunks: ChunkSender,
    ) -> Result<(), BackendError> {
        self.check_connection().await?;

        let url = self.endpoint("api/generate")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "model": model.model_path,
                "prompt": prompt,
                "stream": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::ServerError(format!(
                "generate failed with status {status}: {body}"
            )));
        }

        // One JSON object per line until `done`.
        let byte_stream = response.bytes_stream().map_err(io::Error::other);
        let mut lines = FramedRead::new(StreamReader::new(byte_stream), LinesCodec::new());

        while let Some(line) = lines.next().await {
            let line = line
                .map_err(|e| BackendError::RequestFailed(format!("stream read error: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: GenerateChunk = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("skipping unparseable generate chunk: {e}");
                    continue;
                }
            };
            if let Some(text) = chunk.response {
                if chunks.send(text).is_err() {
                    // receiver went away; drain quietly
                    break;
                }
            }
            if chunk.done.unwrap_or(false) {
                break;
            }
        }
        Ok(())
    }

    async fn available_models(&self) -> Vec<String> {
        match self.list_local_models().await {
            Ok(models) => models.into_iter().map(|m| m.name).collect(),
            Err(e) => {
                warn!("Ollama not reachable, serving fallback catalog: {e}");
                FALLBACK_MODELS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    async fn deploy_model(&self, _model: &TrainedModel) -> Result<String, BackendError> {
        self.check_connection().await?;
        // Models created in Ollama are already servable; deployment just
        // hands out the endpoint.
        Ok(self.endpoint("api/generate")?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Framework, JobStatus};
    use chrono::Utc;

    fn job_fixture() -> TrainingJob {
        TrainingJob {
            id: 1,
            public_job_id: "job_test0001".into(),
            framework: Framework::Ollama,
            base_model: "phi3:mini".into(),
            status: JobStatus::Pending,
            progress: 0.0,
            current_epoch: 0,
            total_epochs: 3,
            loss: None,
            learning_rate: 2e-4,
            batch_size: 8,
            context_length: 4096,
            system_prompt: None,
            dataset_path: None,
            model_path: None,
            logs: None,
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn percent_marker_parsing() {
        let caps = PERCENT_MARKER.captures("transferring 45%").unwrap();
        assert_eq!(&caps["verb"], "transferring");
        assert_eq!(&caps["pct"], "45");
        assert!(PERCENT_MARKER.captures("no progress here").is_none());
    }

    #[test]
    fn next_index_skips_existing_suffixes() {
        let installed = vec![
            "phi3:mini-1".to_string(),
            "phi3:mini-3".to_string(),
            "other-2".to_string(),
        ];
        assert_eq!(next_model_index(&installed, "phi3:mini"), 4);
        assert_eq!(next_model_index(&installed, "mistral:7b"), 1);
        assert_eq!(next_model_index(&[], "phi3:mini"), 1);
    }

    #[test]
    fn modelfile_carries_job_parameters() {
        let mut job = job_fixture();
        job.system_prompt = Some("Answer in French.".into());
        let examples = vec![TrainingExample {
            prompt: "bonjour".into(),
            response: "hello".into(),
        }];

        let modelfile = build_modelfile(&job, &examples);
        assert!(modelfile.starts_with("FROM phi3:mini"));
        assert!(modelfile.contains("SYSTEM \"Answer in French.\""));
        assert!(modelfile.contains("PARAMETER num_ctx 4096"));
        assert!(modelfile.contains("PARAMETER num_batch 8"));
        assert!(modelfile.contains("# Q: bonjour"));
    }
}
