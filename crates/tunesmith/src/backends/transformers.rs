//! Transformers backend: runs the embedded LoRA training script as a
//! local subprocess and parses line-oriented JSON progress records from
//! its stdout. The script announces the saved artifact with a
//! `FINAL_MODEL_PATH:` line.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Backend, BackendError, ChunkSender, ProgressSender, TrainingArtifact};
use crate::config::TrainerRuntime;
use crate::dataset::{self, TrainingExample};
use crate::model::{TrainedModel, TrainingJob};
use crate::progress::ProgressUpdate;

// Embedded so the trainer is always available next to the binary.
const TRAINING_SCRIPT: &str = include_str!("train_lora.py");
const FINAL_MODEL_PATH_PREFIX: &str = "FINAL_MODEL_PATH:";

/// Kept stderr lines for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Hugging Face models known to work with the embedded script.
const MODEL_CATALOG: &[&str] = &[
    "microsoft/DialoGPT-medium",
    "microsoft/DialoGPT-large",
    "facebook/blenderbot-400M-distill",
    "facebook/blenderbot-1B-distill",
    "microsoft/phi-2",
    "codellama/CodeLlama-7b-Python-hf",
    "WizardLM/WizardCoder-Python-7B-V1.0",
];

/// Wire shape of one progress line printed by the training script.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptProgress {
    progress: f32,
    current_epoch: u32,
    #[serde(default)]
    loss: Option<f32>,
    #[serde(default)]
    status: Option<String>,
}

impl From<ScriptProgress> for ProgressUpdate {
    fn from(line: ScriptProgress) -> Self {
        ProgressUpdate {
            progress: line.progress,
            current_epoch: line.current_epoch,
            loss: line.loss,
            status: line.status,
        }
    }
}

pub struct TransformersBackend {
    runtime: TrainerRuntime,
}

impl TransformersBackend {
    pub fn from_env() -> Self {
        Self::new(TrainerRuntime::from_env())
    }

    pub fn new(runtime: TrainerRuntime) -> Self {
        Self { runtime }
    }

    fn run_dir(&self, job: &TrainingJob) -> PathBuf {
        self.runtime.output_root.join(format!("job-{}", job.public_job_id))
    }

    async fn export_csv(examples: &[TrainingExample], path: &Path) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(b"prompt,response\n").await?;
        for example in examples {
            let line = format!(
                "{},{}\n",
                csv_escape(&example.prompt),
                csv_escape(&example.response)
            );
            file.write_all(line.as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Best-effort recursive size of an artifact directory (or file).
fn path_size(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.is_file() {
        return Some(metadata.len());
    }
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Some(total)
}

#[async_trait]
impl Backend for TransformersBackend {
    fn name(&self) -> &'static str {
        "transformers"
    }

    async fn start_training(
        &self,
        job: TrainingJob,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<TrainingArtifact, BackendError> {
        let dataset_path = job
            .dataset_path
            .as_deref()
            .ok_or_else(|| BackendError::ExecutionError("job has no dataset path".into()))?;
        let examples = dataset::load_examples(dataset_path).await?;

        let run_dir = self.run_dir(&job);
        tokio::fs::create_dir_all(&run_dir).await?;

        let script_path = run_dir.join("train_lora.py");
        tokio::fs::write(&script_path, TRAINING_SCRIPT).await?;

        let csv_path = run_dir.join("dataset.csv");
        Self::export_csv(&examples, &csv_path).await?;
        info!(
            job = %job.public_job_id,
            examples = examples.len(),
            run_dir = %run_dir.display(),
            "launching training script"
        );

        let mut cmd = Command::new(&self.runtime.python);
        cmd.arg(&script_path)
            .arg(&job.base_model)
            .arg(&csv_path)
            .arg(&run_dir)
            .current_dir(&run_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::ProcessFailed(format!(
                "failed to spawn training script with {}: {e}",
                self.runtime.python
            ))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut final_model_path: Option<String> = None;
        let mut stderr_tail: VecDeque<String> = VecDeque::new();

        let status = {
            let stdout_pump = async {
                let Some(stdout) = stdout else { return };
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(path) = line.strip_prefix(FINAL_MODEL_PATH_PREFIX) {
                        final_model_path = Some(path.trim().to_string());
                    } else if let Ok(parsed) = serde_json::from_str::<ScriptProgress>(&line) {
                        let _ = progress.send(parsed.into());
                    } else if !line.trim().is_empty() {
                        info!(target: "trainer", "{line}");
                    }
                }
            };
            let stderr_pump = async {
                let Some(stderr) = stderr else { return };
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "trainer", "{line}");
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line);
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                status = async {
                    tokio::join!(stdout_pump, stderr_pump);
                    child.wait().await
                } => Some(status),
            }
        };

        let Some(status) = status else {
            child.kill().await.ok();
            return Err(BackendError::Cancelled);
        };
        let status = status.map_err(|e| {
            BackendError::ProcessFailed(format!("failed to wait for training script: {e}"))
        })?;

        if !status.success() {
            let tail: Vec<String> = stderr_tail.into_iter().collect();
            return Err(BackendError::ProcessFailed(format!(
                "training script exited with {status}: {}",
                tail.join(" | ")
            )));
        }

        let locator = final_model_path
            .unwrap_or_else(|| run_dir.join("final_model").display().to_string());
        let artifact_path = PathBuf::from(&locator);
        let size = tokio::task::spawn_blocking(move || path_size(&artifact_path))
            .await
            .ok()
            .flatten();

        Ok(TrainingArtifact { locator, size })
    }

    async fn test_model_stream(
        &self,
        _model: &TrainedModel,
        _prompt: &str,
        _chunks: ChunkSender,
    ) -> Result<(), BackendError> {
        Err(BackendError::NotSupported(
            "testing is not supported for transformers models; serve the artifact with an \
             inference server instead"
                .into(),
        ))
    }

    async fn available_models(&self) -> Vec<String> {
        MODEL_CATALOG.iter().map(|s| s.to_string()).collect()
    }

    async fn deploy_model(&self, _model: &TrainedModel) -> Result<String, BackendError> {
        Err(BackendError::NotSupported(
            "direct deployment is not supported for transformers models; download the artifact \
             instead"
                .into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn progress_line_parsing() {
        let line = r#"{"progress": 33, "currentEpoch": 1, "loss": 1.2345, "status": "Epoch 1 in progress..."}"#;
        let parsed: ScriptProgress = serde_json::from_str(line).unwrap();
        let update = ProgressUpdate::from(parsed);
        assert_eq!(update.progress, 33.0);
        assert_eq!(update.current_epoch, 1);
        assert_eq!(update.loss, Some(1.2345));
    }

    #[test]
    fn progress_line_without_optionals() {
        let parsed: ScriptProgress =
            serde_json::from_str(r#"{"progress": 10, "currentEpoch": 0}"#).unwrap();
        assert!(parsed.loss.is_none());
        assert!(parsed.status.is_none());
    }

    #[test]
    fn final_path_prefix_is_distinguished() {
        let line = "FINAL_MODEL_PATH:/tmp/run/final_model";
        assert_eq!(
            line.strip_prefix(FINAL_MODEL_PATH_PREFIX).map(str::trim),
            Some("/tmp/run/final_model")
        );
    }

    #[tokio::test]
    async fn csv_export_round_trips_through_dataset_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        let examples = vec![
            TrainingExample {
                prompt: "p1".into(),
                response: "r1".into(),
            },
            TrainingExample {
                prompt: "p2".into(),
                response: "r2".into(),
            },
        ];
        TransformersBackend::export_csv(&examples, &path).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed =
            crate::dataset::parse_examples(&content, crate::dataset::DatasetKind::Csv).unwrap();
        assert_eq!(parsed, examples);
    }
}
