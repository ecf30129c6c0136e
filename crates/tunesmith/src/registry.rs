//! In-flight job registry.
//!
//! Maps a job's public id to the handle for its live training run. The
//! registry exists to route stop requests and to reject a second start for
//! a job that already has a live run. It is owned by the orchestrator
//! instance, not process-global, so independent orchestrators can coexist
//! in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("job '{0}' already has a live training run")]
    AlreadyRunning(String),
}

/// Handle to one in-flight training run.
///
/// Stopping is cooperative: cancelling the token signals the backend,
/// which is expected to halt resource use (kill its subprocess, stop its
/// timer) within a bounded time. The run's eventual outcome settles into
/// the persisted job record, not into this handle.
#[derive(Debug, Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the run to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Authoritative map of public job id → live run handle.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a live handle. Rejects when a handle is already present
    /// for the id (duplicate-start guard).
    pub fn register(&self, job_id: &str, handle: JobHandle) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(job_id) {
            return Err(RegistryError::AlreadyRunning(job_id.to_string()));
        }
        jobs.insert(job_id.to_string(), handle);
        Ok(())
    }

    pub fn lookup(&self, job_id: &str) -> Option<JobHandle> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// Remove a handle. Removing an absent id is a no-op, not an error.
    pub fn remove(&self, job_id: &str) {
        self.jobs.lock().unwrap().remove(job_id);
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_remove() {
        let registry = JobRegistry::new();
        registry.register("job_a", JobHandle::new()).unwrap();

        assert!(registry.is_running("job_a"));
        assert!(registry.lookup("job_a").is_some());
        assert_eq!(registry.running_count(), 1);

        registry.remove("job_a");
        assert!(!registry.is_running("job_a"));
        // removing again is a no-op
        registry.remove("job_a");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = JobRegistry::new();
        registry.register("job_a", JobHandle::new()).unwrap();
        let err = registry.register("job_a", JobHandle::new()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRunning(id) if id == "job_a"));
    }

    #[test]
    fn stop_cancels_the_shared_token() {
        let registry = JobRegistry::new();
        let handle = JobHandle::new();
        let token = handle.cancel_token();
        registry.register("job_a", handle).unwrap();

        registry.lookup("job_a").unwrap().stop();
        assert!(token.is_cancelled());
    }
}
