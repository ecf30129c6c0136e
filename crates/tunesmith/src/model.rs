use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetKind;
use crate::error::OrchestratorError;

/// Execution backend for a fine-tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Ollama,
    Vllm,
    Transformers,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Ollama => "ollama",
            Framework::Vllm => "vllm",
            Framework::Transformers => "transformers",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ollama" => Ok(Framework::Ollama),
            "vllm" => Ok(Framework::Vllm),
            "transformers" => Ok(Framework::Transformers),
            other => Err(OrchestratorError::UnknownFramework(other.to_string())),
        }
    }
}

/// Lifecycle state of a training job.
///
/// `Pending` and `Training` are live states; the remaining three are
/// terminal and admit no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Training,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Training => "training",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fine-tuning execution request and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    /// Store-assigned identifier, never reused.
    pub id: i64,
    /// Opaque external token used for subscription and stop requests.
    pub public_job_id: String,
    pub framework: Framework,
    pub base_model: String,
    pub status: JobStatus,
    /// 0–100, non-decreasing while training.
    pub progress: f32,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub loss: Option<f32>,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub context_length: u32,
    pub system_prompt: Option<String>,
    /// Required before the job may start.
    pub dataset_path: Option<PathBuf>,
    /// Artifact locator: a filesystem path or a backend-native model name.
    pub model_path: Option<String>,
    /// Failure diagnostics, set on the failed transition.
    pub logs: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrainingJob {
    pub framework: Framework,
    pub base_model: String,
    pub total_epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub context_length: u32,
    pub system_prompt: Option<String>,
    pub dataset_path: Option<PathBuf>,
}

impl NewTrainingJob {
    pub fn new(framework: Framework, base_model: impl Into<String>) -> Self {
        Self {
            framework,
            base_model: base_model.into(),
            total_epochs: 3,
            learning_rate: 2e-4,
            batch_size: 4,
            context_length: 2048,
            system_prompt: None,
            dataset_path: None,
        }
    }

    pub fn total_epochs(mut self, total_epochs: u32) -> Self {
        self.total_epochs = total_epochs;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn dataset_path(mut self, dataset_path: impl Into<PathBuf>) -> Self {
        self.dataset_path = Some(dataset_path.into());
        self
    }
}

/// Artifact record produced by a successfully completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub id: i64,
    /// Owning job, lookup only.
    pub training_job_id: i64,
    pub name: String,
    pub framework: Framework,
    pub base_model: String,
    pub model_path: String,
    /// Best-effort size in bytes.
    pub size: Option<u64>,
    pub deployed: bool,
    pub deployment_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when recording a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrainedModel {
    pub training_job_id: i64,
    pub name: String,
    pub framework: Framework,
    pub base_model: String,
    pub model_path: String,
    pub size: Option<u64>,
}

/// An uploaded training corpus, referenced by path from a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    pub kind: DatasetKind,
    pub example_count: Option<usize>,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering an uploaded dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataset {
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    pub kind: DatasetKind,
    pub example_count: Option<usize>,
    pub file_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_builder_defaults() {
        let new = NewTrainingJob::new(Framework::Ollama, "llama3.1:8b")
            .total_epochs(5)
            .system_prompt("You are terse.");

        assert_eq!(new.base_model, "llama3.1:8b");
        assert_eq!(new.total_epochs, 5);
        assert_eq!(new.batch_size, 4);
        assert_eq!(new.system_prompt.as_deref(), Some("You are terse."));
        assert!(new.dataset_path.is_none());
    }

    #[test]
    fn framework_round_trip() {
        for framework in [Framework::Ollama, Framework::Vllm, Framework::Transformers] {
            assert_eq!(framework.as_str().parse::<Framework>().unwrap(), framework);
        }
        assert!("pytorch".parse::<Framework>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Training.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
