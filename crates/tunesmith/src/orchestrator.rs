//! The training-job orchestration core.
//!
//! The orchestrator owns the job lifecycle state machine
//! (`pending → training → {completed | failed | cancelled}`), selects the
//! backend adapter for a job's framework, relays the backend's progress
//! stream to persistence and to live subscribers, and reconciles final
//! state with the persisted record exactly once.
//!
//! Every progress tick is persisted before it becomes observable to
//! subscribers, so a client that reconnects and polls the record sees at
//! least the last durable value even if it missed the push event.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::{self, Backend, BackendError, ChunkSender};
use crate::dataset;
use crate::error::OrchestratorError;
use crate::model::{
    Dataset, Framework, JobStatus, NewDataset, NewTrainedModel, NewTrainingJob, TrainedModel,
    TrainingJob,
};
use crate::progress::{JobEvent, ProgressHub, ProgressUpdate};
use crate::registry::{JobHandle, JobRegistry};
use crate::storage::{JobStore, JobUpdate, ModelUpdate};

/// External broadcast collaborator. The transport layer implements this to
/// push events to end clients; the lifecycle is correct with none attached.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, job_id: &str, event: &JobEvent);
}

/// Orchestrates training jobs across the registered backends.
///
/// Cloning is cheap and shares the same registry, progress hub, and store;
/// the background task driving each job holds such a clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    backends: HashMap<Framework, Arc<dyn Backend>>,
    registry: Arc<JobRegistry>,
    hub: Arc<ProgressHub>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl Orchestrator {
    /// Build an orchestrator with the stock environment-configured
    /// backends.
    pub fn new(store: Arc<dyn JobStore>) -> anyhow::Result<Self> {
        Ok(Self::with_backends(store, backends::stock_backends()?))
    }

    /// Build an orchestrator with an explicit backend table.
    pub fn with_backends(
        store: Arc<dyn JobStore>,
        backends: HashMap<Framework, Arc<dyn Backend>>,
    ) -> Self {
        Self {
            store,
            backends,
            registry: Arc::new(JobRegistry::new()),
            hub: Arc::new(ProgressHub::new()),
            broadcaster: None,
        }
    }

    /// Register or replace the adapter for a framework.
    pub fn with_backend(mut self, framework: Framework, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(framework, backend);
        self
    }

    /// Attach the external broadcast collaborator.
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Subscribe to a job's live events. Returns `None` once the job has
    /// reached a terminal state (or for unknown ids) — finished jobs never
    /// replay.
    pub fn subscribe(&self, public_job_id: &str) -> Option<broadcast::Receiver<JobEvent>> {
        self.hub.subscribe(public_job_id)
    }

    fn backend_for(&self, framework: Framework) -> Result<Arc<dyn Backend>, OrchestratorError> {
        self.backends
            .get(&framework)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownFramework(framework.to_string()))
    }

    /// Validate and persist a new job, then launch its training run in the
    /// background. Returns the pending record immediately.
    pub async fn create_job(&self, new: NewTrainingJob) -> Result<TrainingJob, OrchestratorError> {
        // Unknown frameworks fail before any state transition.
        let backend = self.backend_for(new.framework)?;
        validate_job(&new)?;

        let job = self.store.create_job(new).await?;
        // Open the event channel before the run starts so subscribers who
        // attach right after creation see the training transition.
        self.hub.open(&job.public_job_id);
        self.start_job(job.clone(), backend)?;
        Ok(job)
    }

    /// Launch the training run for a persisted job. Rejects when a live
    /// run already exists for the job's public id.
    fn start_job(
        &self,
        job: TrainingJob,
        backend: Arc<dyn Backend>,
    ) -> Result<(), OrchestratorError> {
        let handle = JobHandle::new();
        let cancel = handle.cancel_token();
        self.registry.register(&job.public_job_id, handle)?;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(job, backend, cancel).await;
        });
        Ok(())
    }

    /// Drive one job from `training` to a terminal state.
    async fn run_job(
        &self,
        job: TrainingJob,
        backend: Arc<dyn Backend>,
        cancel: CancellationToken,
    ) {
        let public_job_id = job.public_job_id.clone();
        info!(
            job = %public_job_id,
            backend = backend.name(),
            base_model = %job.base_model,
            "starting training job"
        );

        self.persist(
            job.id,
            JobUpdate {
                status: Some(JobStatus::Training),
                start_time: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
        self.emit(
            &public_job_id,
            JobEvent::Started {
                progress: 0.0,
                current_epoch: 0,
            },
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn({
            let backend = backend.clone();
            let job = job.clone();
            let cancel = cancel.clone();
            async move { backend.start_training(job, tx, cancel).await }
        });

        // The channel closes when the backend drops its sender, so every
        // tick is relayed before the result is examined.
        while let Some(update) = rx.recv().await {
            self.record_progress(&job, update).await;
        }

        let result = match run.await {
            Ok(result) => result,
            Err(e) => Err(BackendError::ExecutionError(format!(
                "training task aborted: {e}"
            ))),
        };
        self.finalize(&job, result).await;

        self.registry.remove(&public_job_id);
        self.hub.close(&public_job_id);
    }

    /// Persist a backend tick, then republish it to subscribers.
    async fn record_progress(&self, job: &TrainingJob, update: ProgressUpdate) {
        self.persist(
            job.id,
            JobUpdate {
                progress: Some(update.progress),
                current_epoch: Some(update.current_epoch),
                loss: update.loss,
                ..Default::default()
            },
        )
        .await;
        self.emit(&job.public_job_id, JobEvent::Progress(update));
    }

    /// Reconcile the run's outcome with the persisted record. Terminal
    /// states are never overwritten: if a concurrent stop already
    /// finalized the job, a late success or failure is discarded (and no
    /// model record is created).
    async fn finalize(&self, job: &TrainingJob, result: Result<backends::TrainingArtifact, BackendError>) {
        let already_terminal = match self.store.get_job(job.id).await {
            Ok(Some(current)) => current.status.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                error!(job = %job.public_job_id, "failed to re-read job record: {e}");
                false
            }
        };

        match result {
            Ok(artifact) if !already_terminal => {
                let model = NewTrainedModel {
                    training_job_id: job.id,
                    name: format!("{}-custom-{}", job.base_model, Utc::now().timestamp_millis()),
                    framework: job.framework,
                    base_model: job.base_model.clone(),
                    model_path: artifact.locator.clone(),
                    size: artifact.size,
                };
                let update = JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress: Some(100.0),
                    model_path: Some(artifact.locator.clone()),
                    end_time: Some(Utc::now()),
                    ..Default::default()
                };
                match self.store.complete_job(job.id, update, model).await {
                    Ok(Some(_)) => {
                        info!(job = %job.public_job_id, model = %artifact.locator, "training job completed");
                        self.emit(
                            &job.public_job_id,
                            JobEvent::Completed {
                                progress: 100.0,
                                model_path: artifact.locator,
                            },
                        );
                    }
                    Ok(None) => {
                        warn!(job = %job.public_job_id, "job record vanished before completion")
                    }
                    Err(e) => {
                        error!(job = %job.public_job_id, "failed to persist completion: {e}")
                    }
                }
            }
            Ok(_) => {
                info!(
                    job = %job.public_job_id,
                    "backend finished after job reached a terminal state; artifact discarded"
                );
            }
            Err(BackendError::Cancelled) => {
                self.persist(
                    job.id,
                    JobUpdate {
                        status: Some(JobStatus::Cancelled),
                        end_time: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
                self.emit(&job.public_job_id, JobEvent::Cancelled);
                info!(job = %job.public_job_id, "training job cancelled");
            }
            Err(e) if !already_terminal => {
                warn!(job = %job.public_job_id, error = %e, "training job failed");
                self.persist(
                    job.id,
                    JobUpdate {
                        status: Some(JobStatus::Failed),
                        logs: Some(e.to_string()),
                        end_time: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
                self.emit(
                    &job.public_job_id,
                    JobEvent::Failed {
                        error: e.to_string(),
                    },
                );
            }
            Err(e) => {
                debug!(job = %job.public_job_id, "backend error after terminal state: {e}");
            }
        }
    }

    /// Stop a running job. Idempotent: stopping a finished or unknown job
    /// succeeds without changing anything.
    pub async fn stop_training(&self, public_job_id: &str) -> Result<(), OrchestratorError> {
        let Some(handle) = self.registry.lookup(public_job_id) else {
            debug!(job = %public_job_id, "stop requested for job with no live run");
            return Ok(());
        };

        info!(job = %public_job_id, "stopping training job");
        handle.stop();

        if let Some(job) = self.store.get_job_by_public_id(public_job_id).await? {
            if !job.status.is_terminal() {
                self.store
                    .update_job(
                        job.id,
                        JobUpdate {
                            status: Some(JobStatus::Cancelled),
                            end_time: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        self.registry.remove(public_job_id);
        Ok(())
    }

    /// Stream inference output for a trained model. Backend errors surface
    /// to the caller; job and model state are untouched.
    pub async fn test_model_stream(
        &self,
        model: &TrainedModel,
        prompt: &str,
        chunks: ChunkSender,
    ) -> Result<(), OrchestratorError> {
        let backend = self.backend_for(model.framework)?;
        backend
            .test_model_stream(model, prompt, chunks)
            .await
            .map_err(OrchestratorError::from)
    }

    /// Deploy a trained model and persist its endpoint. Fails without
    /// mutating state when the backend rejects the deployment.
    pub async fn deploy_model(&self, model_id: i64) -> Result<TrainedModel, OrchestratorError> {
        let model = self
            .store
            .get_model(model_id)
            .await?
            .ok_or(OrchestratorError::ModelNotFound(model_id))?;
        let backend = self.backend_for(model.framework)?;
        let endpoint = backend.deploy_model(&model).await?;

        info!(model = %model.name, endpoint = %endpoint, "model deployed");
        self.store
            .update_model(
                model_id,
                ModelUpdate {
                    deployed: Some(true),
                    deployment_endpoint: Some(endpoint),
                },
            )
            .await?
            .ok_or(OrchestratorError::ModelNotFound(model_id))
    }

    /// Base models offered by a framework's backend. Unknown frameworks
    /// yield an empty catalog.
    pub async fn available_models(&self, framework: Framework) -> Vec<String> {
        match self.backends.get(&framework) {
            Some(backend) => backend.available_models().await,
            None => Vec::new(),
        }
    }

    pub async fn get_job(&self, public_job_id: &str) -> Result<Option<TrainingJob>, OrchestratorError> {
        Ok(self.store.get_job_by_public_id(public_job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<TrainingJob>, OrchestratorError> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn list_models(&self) -> Result<Vec<TrainedModel>, OrchestratorError> {
        Ok(self.store.list_models().await?)
    }

    /// Record an uploaded dataset, counting its examples best-effort when
    /// the caller did not.
    pub async fn register_dataset(
        &self,
        mut new: NewDataset,
    ) -> Result<Dataset, OrchestratorError> {
        if new.example_count.is_none() {
            match tokio::fs::read_to_string(&new.file_path).await {
                Ok(content) => {
                    new.example_count = Some(dataset::count_examples(&content, new.kind));
                }
                Err(e) => warn!(
                    path = %new.file_path.display(),
                    "failed to count dataset examples: {e}"
                ),
            }
        }
        Ok(self.store.create_dataset(new).await?)
    }

    /// Delete a dataset record and its file. Jobs referencing the path are
    /// not guarded; they fail at start time when the file is gone.
    pub async fn delete_dataset(&self, dataset_id: i64) -> Result<bool, OrchestratorError> {
        let Some(dataset) = self.store.get_dataset(dataset_id).await? else {
            return Ok(false);
        };
        if let Err(e) = tokio::fs::remove_file(&dataset.file_path).await {
            warn!(path = %dataset.file_path.display(), "failed to delete dataset file: {e}");
        }
        Ok(self.store.delete_dataset(dataset_id).await?)
    }

    async fn persist(&self, job_id: i64, update: JobUpdate) {
        match self.store.update_job(job_id, update).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(job_id, "update targeted an absent job record"),
            Err(e) => error!(job_id, "failed to persist job update: {e}"),
        }
    }

    fn emit(&self, public_job_id: &str, event: JobEvent) {
        self.hub.publish(public_job_id, event.clone());
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(public_job_id, &event);
        }
    }
}

fn validate_job(new: &NewTrainingJob) -> Result<(), OrchestratorError> {
    if new.dataset_path.is_none() {
        return Err(OrchestratorError::Validation(
            "a dataset is required for training".into(),
        ));
    }
    if new.base_model.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "a base model must be selected".into(),
        ));
    }
    if new.total_epochs == 0 {
        return Err(OrchestratorError::Validation(
            "total epochs must be greater than 0".into(),
        ));
    }
    if new.batch_size == 0 {
        return Err(OrchestratorError::Validation(
            "batch size must be greater than 0".into(),
        ));
    }
    if new.learning_rate <= 0.0 {
        return Err(OrchestratorError::Validation(
            "learning rate must be greater than 0".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_bad_fields() {
        let missing_dataset = NewTrainingJob::new(Framework::Ollama, "phi3:mini");
        assert!(matches!(
            validate_job(&missing_dataset),
            Err(OrchestratorError::Validation(_))
        ));

        let zero_epochs = NewTrainingJob::new(Framework::Ollama, "phi3:mini")
            .dataset_path("/tmp/data.jsonl")
            .total_epochs(0);
        assert!(validate_job(&zero_epochs).is_err());

        let bad_lr = NewTrainingJob::new(Framework::Ollama, "phi3:mini")
            .dataset_path("/tmp/data.jsonl")
            .learning_rate(0.0);
        assert!(validate_job(&bad_lr).is_err());

        let ok = NewTrainingJob::new(Framework::Ollama, "phi3:mini")
            .dataset_path("/tmp/data.jsonl");
        assert!(validate_job(&ok).is_ok());
    }
}
