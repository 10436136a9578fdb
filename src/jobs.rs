use crate::core::{BuildAndFlashResult, BuildResult, DetectResult, FlashResult};
use crate::orchestrator::OperationKind;
use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Operation results a job can carry.
pub trait Outcome {
    fn succeeded(&self) -> bool;
    fn summary(&self) -> &str;
}

macro_rules! outcome {
    ($($ty:ty),*) => {
        $(impl Outcome for $ty {
            fn succeeded(&self) -> bool {
                self.success
            }
            fn summary(&self) -> &str {
                &self.message
            }
        })*
    };
}

outcome!(BuildResult, FlashResult, DetectResult, BuildAndFlashResult);

tokio::task_local! {
    static ON_START: Box<dyn Fn() + Send + Sync>;
}

/// Marks the job driving the current task as running. Operations call this
/// once they hold the orchestrator gate; outside a job it does nothing.
pub fn mark_started() {
    let _ = ON_START.try_with(|hook| hook());
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct ForgeJob {
    pub id: Uuid,
    pub kind: OperationKind,
    pub status: JobStatus,
    pub workspace: Option<PathBuf>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ForgeJob {
    pub fn new(kind: OperationKind, workspace: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            workspace,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(now_secs());
    }

    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now_secs());
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: String, result: Option<serde_json::Value>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(now_secs());
        self.error = Some(error);
        self.result = result;
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now_secs());
        self.error = Some("Job cancelled".to_string());
    }
}

/// Background operations, polled by id. Cancelling aborts the task, which
/// drops the operation future and kills any child process it owns.
#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<Uuid, ForgeJob>>>,
    handles: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_job(&self, job: ForgeJob) -> Uuid {
        let job_id = job.id;
        self.jobs.write().insert(job_id, job);
        job_id
    }

    /// Register a job and run `operation` on the runtime. The job stays
    /// queued until the operation reports it has started.
    pub fn spawn<F, T>(&self, kind: OperationKind, workspace: Option<PathBuf>, operation: F) -> Uuid
    where
        F: Future<Output = T> + Send + 'static,
        T: Outcome + Serialize + Send + 'static,
    {
        let job_id = self.submit_job(ForgeJob::new(kind, workspace));
        let manager = self.clone();
        let starter = self.clone();
        let on_start: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            let _ = starter.update_job(&job_id, |job| {
                if job.status == JobStatus::Queued {
                    job.start();
                }
            });
        });
        let handle = tokio::spawn(ON_START.scope(on_start, async move {
            let outcome = operation.await;
            let value = serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
            let succeeded = outcome.succeeded();
            let summary = outcome.summary().to_string();
            let _ = manager.update_job(&job_id, |job| {
                if job.status.is_finished() {
                    return;
                }
                if succeeded {
                    job.complete(value);
                } else {
                    job.fail(summary, Some(value));
                }
            });
            tracing::info!("Job {} finished (success: {})", job_id, succeeded);
        }));
        self.handles.write().insert(job_id, handle);
        job_id
    }

    pub fn get_job(&self, job_id: &Uuid) -> Option<ForgeJob> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn update_job<F>(&self, job_id: &Uuid, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut ForgeJob),
    {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            update_fn(job);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Job not found: {}", job_id))
        }
    }

    /// Newest first.
    pub fn list_jobs(&self) -> Vec<ForgeJob> {
        let mut jobs: Vec<ForgeJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn cleanup_completed_jobs(&self, max_age_seconds: u64) -> usize {
        let now = now_secs();
        let expired: Vec<Uuid> = self
            .jobs
            .read()
            .iter()
            .filter(|(_, job)| {
                job.completed_at
                    .is_some_and(|done| now.saturating_sub(done) > max_age_seconds)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut jobs = self.jobs.write();
        let mut handles = self.handles.write();
        for job_id in &expired {
            jobs.remove(job_id);
            if let Some(handle) = handles.remove(job_id) {
                handle.abort();
            }
        }
        expired.len()
    }

    /// Returns false when the job had already finished.
    pub fn cancel_job(&self, job_id: &Uuid) -> Result<bool> {
        let mut cancelled = false;
        self.update_job(job_id, |job| {
            if !job.status.is_finished() {
                job.cancel();
                cancelled = true;
            }
        })?;
        if let Some(handle) = self.handles.write().remove(job_id) {
            handle.abort();
        }
        if cancelled {
            tracing::warn!("Job {} cancelled", job_id);
        }
        Ok(cancelled)
    }
}
