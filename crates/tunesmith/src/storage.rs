//! Persistence collaborator.
//!
//! The orchestrator treats persistence as a record store with CRUD plus
//! partial-merge updates. Updates are last-write-wins replacements keyed
//! by job id; every applied update refreshes `updated_at`. `complete_job`
//! applies the final job update and creates the trained-model record as
//! one atomic step, so a crash can never leave a completed job without its
//! model record or vice versa.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use tokio::sync::RwLock;

use crate::model::{
    Dataset, JobStatus, NewDataset, NewTrainedModel, NewTrainingJob, TrainedModel, TrainingJob,
};

/// Partial update over a training job record. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub current_epoch: Option<u32>,
    pub loss: Option<f32>,
    pub model_path: Option<String>,
    pub logs: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Partial update over a trained-model record.
#[derive(Debug, Clone, Default)]
pub struct ModelUpdate {
    pub deployed: Option<bool>,
    pub deployment_endpoint: Option<String>,
}

/// Record store the orchestrator persists into.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewTrainingJob) -> Result<TrainingJob>;
    async fn get_job(&self, id: i64) -> Result<Option<TrainingJob>>;
    async fn get_job_by_public_id(&self, public_job_id: &str) -> Result<Option<TrainingJob>>;
    async fn list_jobs(&self) -> Result<Vec<TrainingJob>>;
    /// Merge `update` over the existing record; absent job yields `None`.
    async fn update_job(&self, id: i64, update: JobUpdate) -> Result<Option<TrainingJob>>;
    /// Apply the completed-transition update and create the trained-model
    /// record atomically. Absent job yields `None` and creates nothing.
    async fn complete_job(
        &self,
        id: i64,
        update: JobUpdate,
        model: NewTrainedModel,
    ) -> Result<Option<(TrainingJob, TrainedModel)>>;

    async fn create_model(&self, new: NewTrainedModel) -> Result<TrainedModel>;
    async fn get_model(&self, id: i64) -> Result<Option<TrainedModel>>;
    async fn list_models(&self) -> Result<Vec<TrainedModel>>;
    async fn models_for_job(&self, training_job_id: i64) -> Result<Vec<TrainedModel>>;
    async fn update_model(&self, id: i64, update: ModelUpdate) -> Result<Option<TrainedModel>>;

    async fn create_dataset(&self, new: NewDataset) -> Result<Dataset>;
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>>;
    async fn list_datasets(&self) -> Result<Vec<Dataset>>;
    async fn delete_dataset(&self, id: i64) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<i64, TrainingJob>,
    models: HashMap<i64, TrainedModel>,
    datasets: HashMap<i64, Dataset>,
    next_job_id: i64,
    next_model_id: i64,
    next_dataset_id: i64,
}

/// In-memory store for development and tests. A single write lock covers
/// all tables, which makes `complete_job` atomic.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_job_update(job: &mut TrainingJob, update: JobUpdate) {
    if let Some(status) = update.status {
        job.status = status;
    }
    if let Some(progress) = update.progress {
        job.progress = progress;
    }
    if let Some(current_epoch) = update.current_epoch {
        job.current_epoch = current_epoch;
    }
    if update.loss.is_some() {
        job.loss = update.loss;
    }
    if update.model_path.is_some() {
        job.model_path = update.model_path;
    }
    if update.logs.is_some() {
        job.logs = update.logs;
    }
    if update.start_time.is_some() {
        job.start_time = update.start_time;
    }
    if update.end_time.is_some() {
        job.end_time = update.end_time;
    }
    job.updated_at = Utc::now();
}

impl Tables {
    fn insert_job(&mut self, new: NewTrainingJob) -> TrainingJob {
        self.next_job_id += 1;
        let now = Utc::now();
        let job = TrainingJob {
            id: self.next_job_id,
            public_job_id: format!("job_{}", nanoid!(8)),
            framework: new.framework,
            base_model: new.base_model,
            status: JobStatus::Pending,
            progress: 0.0,
            current_epoch: 0,
            total_epochs: new.total_epochs,
            loss: None,
            learning_rate: new.learning_rate,
            batch_size: new.batch_size,
            context_length: new.context_length,
            system_prompt: new.system_prompt,
            dataset_path: new.dataset_path,
            model_path: None,
            logs: None,
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn insert_model(&mut self, new: NewTrainedModel) -> TrainedModel {
        self.next_model_id += 1;
        let model = TrainedModel {
            id: self.next_model_id,
            training_job_id: new.training_job_id,
            name: new.name,
            framework: new.framework,
            base_model: new.base_model,
            model_path: new.model_path,
            size: new.size,
            deployed: false,
            deployment_endpoint: None,
            created_at: Utc::now(),
        };
        self.models.insert(model.id, model.clone());
        model
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewTrainingJob) -> Result<TrainingJob> {
        let mut tables = self.tables.write().await;
        Ok(tables.insert_job(new))
    }

    async fn get_job(&self, id: i64) -> Result<Option<TrainingJob>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.get(&id).cloned())
    }

    async fn get_job_by_public_id(&self, public_job_id: &str) -> Result<Option<TrainingJob>> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .find(|job| job.public_job_id == public_job_id)
            .cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<TrainingJob>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<TrainingJob> = tables.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn update_job(&self, id: i64, update: JobUpdate) -> Result<Option<TrainingJob>> {
        let mut tables = self.tables.write().await;
        Ok(tables.jobs.get_mut(&id).map(|job| {
            apply_job_update(job, update);
            job.clone()
        }))
    }

    async fn complete_job(
        &self,
        id: i64,
        update: JobUpdate,
        model: NewTrainedModel,
    ) -> Result<Option<(TrainingJob, TrainedModel)>> {
        let mut tables = self.tables.write().await;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        apply_job_update(job, update);
        let job = job.clone();
        let model = tables.insert_model(model);
        Ok(Some((job, model)))
    }

    async fn create_model(&self, new: NewTrainedModel) -> Result<TrainedModel> {
        let mut tables = self.tables.write().await;
        Ok(tables.insert_model(new))
    }

    async fn get_model(&self, id: i64) -> Result<Option<TrainedModel>> {
        let tables = self.tables.read().await;
        Ok(tables.models.get(&id).cloned())
    }

    async fn list_models(&self) -> Result<Vec<TrainedModel>> {
        let tables = self.tables.read().await;
        let mut models: Vec<TrainedModel> = tables.models.values().cloned().collect();
        models.sort_by_key(|model| model.id);
        Ok(models)
    }

    async fn models_for_job(&self, training_job_id: i64) -> Result<Vec<TrainedModel>> {
        let tables = self.tables.read().await;
        Ok(tables
            .models
            .values()
            .filter(|model| model.training_job_id == training_job_id)
            .cloned()
            .collect())
    }

    async fn update_model(&self, id: i64, update: ModelUpdate) -> Result<Option<TrainedModel>> {
        let mut tables = self.tables.write().await;
        Ok(tables.models.get_mut(&id).map(|model| {
            if let Some(deployed) = update.deployed {
                model.deployed = deployed;
            }
            if update.deployment_endpoint.is_some() {
                model.deployment_endpoint = update.deployment_endpoint;
            }
            model.clone()
        }))
    }

    async fn create_dataset(&self, new: NewDataset) -> Result<Dataset> {
        let mut tables = self.tables.write().await;
        tables.next_dataset_id += 1;
        let dataset = Dataset {
            id: tables.next_dataset_id,
            filename: new.filename,
            original_name: new.original_name,
            size: new.size,
            kind: new.kind,
            example_count: new.example_count,
            file_path: new.file_path,
            created_at: Utc::now(),
        };
        tables.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>> {
        let tables = self.tables.read().await;
        Ok(tables.datasets.get(&id).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let tables = self.tables.read().await;
        let mut datasets: Vec<Dataset> = tables.datasets.values().cloned().collect();
        datasets.sort_by_key(|dataset| dataset.id);
        Ok(datasets)
    }

    async fn delete_dataset(&self, id: i64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.datasets.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Framework;

    fn new_job() -> NewTrainingJob {
        NewTrainingJob::new(Framework::Ollama, "llama3.1:8b").dataset_path("/tmp/data.jsonl")
    }

    #[tokio::test]
    async fn create_assigns_unique_ids_and_pending_state() {
        let store = MemoryStore::new();
        let first = store.create_job(new_job()).await.unwrap();
        let second = store.create_job(new_job()).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.public_job_id, second.public_job_id);
        assert!(first.public_job_id.starts_with("job_"));
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.progress, 0.0);
        assert!(first.start_time.is_none());
    }

    #[tokio::test]
    async fn update_merges_partial_fields() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();

        let updated = store
            .update_job(
                job.id,
                JobUpdate {
                    progress: Some(42.0),
                    loss: Some(1.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.progress, 42.0);
        assert_eq!(updated.loss, Some(1.5));
        // untouched fields survive the merge
        assert_eq!(updated.base_model, "llama3.1:8b");
        assert_eq!(updated.status, JobStatus::Pending);
        assert!(updated.updated_at >= job.updated_at);
    }

    #[tokio::test]
    async fn update_of_absent_job_is_none() {
        let store = MemoryStore::new();
        let result = store.update_job(999, JobUpdate::default()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn complete_job_creates_exactly_one_model() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();

        let (finished, model) = store
            .complete_job(
                job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress: Some(100.0),
                    model_path: Some("llama3.1:8b-1".into()),
                    end_time: Some(Utc::now()),
                    ..Default::default()
                },
                NewTrainedModel {
                    training_job_id: job.id,
                    name: "llama3.1:8b-custom".into(),
                    framework: job.framework,
                    base_model: job.base_model.clone(),
                    model_path: "llama3.1:8b-1".into(),
                    size: Some(500),
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(model.training_job_id, job.id);
        assert!(!model.deployed);
        assert_eq!(store.models_for_job(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_job_for_absent_job_creates_nothing() {
        let store = MemoryStore::new();
        let result = store
            .complete_job(
                7,
                JobUpdate::default(),
                NewTrainedModel {
                    training_job_id: 7,
                    name: "orphan".into(),
                    framework: Framework::Ollama,
                    base_model: "m".into(),
                    model_path: "m-1".into(),
                    size: None,
                },
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.list_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn public_id_lookup() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        let found = store
            .get_job_by_public_id(&job.public_job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, job.id);
        assert!(store.get_job_by_public_id("job_missing").await.unwrap().is_none());
    }
}
