//! Import job queue
//!
//! Durable record of import attempts plus the (user, module) lock. A job in
//! `none`, `running` or `scheduled` holds the lock; every transition into
//! those statuses either wins the lock atomically or fails with `Locked`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::queries;
use crate::error::ImportError;
use crate::types::{ImportCounts, ImportJob, JobStatus, NewImportJob};

#[async_trait]
pub trait ImportQueue: Send + Sync {
    /// Create a job in `status` (NONE or SCHEDULED). Fails with `Locked` if
    /// another job holds the module; retires earlier HALTED jobs of the
    /// same (user, module).
    async fn enqueue(&self, new_job: NewImportJob, status: JobStatus) -> Result<ImportJob, ImportError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ImportJob>, ImportError>;

    /// The job holding the (user, module) lock
    async fn get_active_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError>;

    /// Most recent current job of the (user, module), whatever its status
    async fn latest_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError>;

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<ImportJob, ImportError>;

    /// Move an unfinished, current job to RUNNING
    async fn claim_for_run(&self, job_id: Uuid) -> Result<ImportJob, ImportError>;

    /// Every current job of the user, oldest first
    async fn all_active_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<ImportJob>, ImportError>;

    async fn scheduled_jobs(&self, limit: usize) -> Result<Vec<ImportJob>, ImportError>;

    /// Record final counts and release the lock. Returns true only for the
    /// call that actually finalized the job.
    async fn finalize(&self, job_id: Uuid, counts: &ImportCounts) -> Result<bool, ImportError>;

    /// Returns false if the job is unfinished or already undone
    async fn mark_undone(&self, job_id: Uuid) -> Result<bool, ImportError>;
}

/// Explain why a job could not be claimed
fn claim_refusal(job: &ImportJob) -> ImportError {
    if job.is_finished() {
        ImportError::InvalidInput(format!("import job {} is already finished", job.id))
    } else if job.superseded_at.is_some() {
        ImportError::InvalidInput(format!("import job {} was replaced by a newer import", job.id))
    } else {
        ImportError::locked(&job.module, Some(job.id))
    }
}

// =============================================================================
// PgImportQueue
// =============================================================================

pub struct PgImportQueue {
    pool: PgPool,
}

impl PgImportQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImportQueue for PgImportQueue {
    async fn enqueue(&self, new_job: NewImportJob, status: JobStatus) -> Result<ImportJob, ImportError> {
        let job = queries::import_queue::insert_job(&self.pool, &new_job, status).await?;
        info!(job_id = %job.id, user_id = %job.user_id, module = %job.module, status = job.status.as_str(), "Import job enqueued");
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        queries::import_queue::get_job(&self.pool, job_id).await
    }

    async fn get_active_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        queries::import_queue::get_active_job(&self.pool, user_id, module).await
    }

    async fn latest_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        queries::import_queue::get_latest_job(&self.pool, user_id, module).await
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<ImportJob, ImportError> {
        let job = queries::import_queue::set_status(&self.pool, job_id, status)
            .await?
            .ok_or(ImportError::JobNotFound(job_id))?;
        debug!(job_id = %job.id, module = %job.module, status = status.as_str(), "Import job status updated");
        Ok(job)
    }

    async fn claim_for_run(&self, job_id: Uuid) -> Result<ImportJob, ImportError> {
        if let Some(job) = queries::import_queue::claim_job(&self.pool, job_id).await? {
            return Ok(job);
        }
        let job = self.get(job_id).await?.ok_or(ImportError::JobNotFound(job_id))?;
        Err(claim_refusal(&job))
    }

    async fn all_active_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<ImportJob>, ImportError> {
        queries::import_queue::list_current_jobs(&self.pool, user_id).await
    }

    async fn scheduled_jobs(&self, limit: usize) -> Result<Vec<ImportJob>, ImportError> {
        queries::import_queue::list_scheduled_jobs(&self.pool, limit).await
    }

    async fn finalize(&self, job_id: Uuid, counts: &ImportCounts) -> Result<bool, ImportError> {
        queries::import_queue::finalize_job(&self.pool, job_id, counts).await
    }

    async fn mark_undone(&self, job_id: Uuid) -> Result<bool, ImportError> {
        queries::import_queue::set_undone(&self.pool, job_id).await
    }
}

// =============================================================================
// MemoryImportQueue
// =============================================================================

/// In-process queue. One mutex guards every job, so lock checks and the
/// transitions they protect happen under the same guard.
#[derive(Default)]
pub struct MemoryImportQueue {
    jobs: Mutex<HashMap<Uuid, ImportJob>>,
}

impl MemoryImportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_holder(jobs: &HashMap<Uuid, ImportJob>, user_id: Uuid, module: &str, except: Uuid) -> Option<Uuid> {
        jobs.values()
            .find(|j| j.id != except && j.user_id == user_id && j.module == module && j.status.holds_lock())
            .map(|j| j.id)
    }
}

#[async_trait]
impl ImportQueue for MemoryImportQueue {
    async fn enqueue(&self, new_job: NewImportJob, status: JobStatus) -> Result<ImportJob, ImportError> {
        let mut jobs = self.jobs.lock();
        if let Some(holder) = Self::lock_holder(&jobs, new_job.user_id, &new_job.module, Uuid::nil()) {
            return Err(ImportError::locked(&new_job.module, Some(holder)));
        }

        let now = Utc::now();
        for job in jobs.values_mut() {
            if job.user_id == new_job.user_id
                && job.module == new_job.module
                && job.status == JobStatus::Halted
                && job.superseded_at.is_none()
            {
                job.superseded_at = Some(now);
                job.updated_at = now;
            }
        }

        let job = new_job.into_job(status);
        info!(job_id = %job.id, user_id = %job.user_id, module = %job.module, status = job.status.as_str(), "Import job enqueued");
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn get_active_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        Ok(self
            .jobs
            .lock()
            .values()
            .find(|j| j.user_id == user_id && j.module == module && j.status.holds_lock())
            .cloned())
    }

    async fn latest_job(&self, module: &str, user_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.user_id == user_id && j.module == module && j.is_current())
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<ImportJob, ImportError> {
        let mut jobs = self.jobs.lock();
        let (user_id, module) = {
            let job = jobs.get(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
            (job.user_id, job.module.clone())
        };
        if status.holds_lock() {
            if let Some(holder) = Self::lock_holder(&jobs, user_id, &module, job_id) {
                return Err(ImportError::locked(&module, Some(holder)));
            }
        }

        let job = jobs.get_mut(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
        job.status = status;
        job.updated_at = Utc::now();
        debug!(job_id = %job.id, module = %job.module, status = status.as_str(), "Import job status updated");
        Ok(job.clone())
    }

    async fn claim_for_run(&self, job_id: Uuid) -> Result<ImportJob, ImportError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
        if job.status == JobStatus::Running || job.is_finished() || !job.is_current() {
            return Err(claim_refusal(job));
        }
        if let Some(holder) = Self::lock_holder(&jobs, job.user_id, &job.module, job_id) {
            return Err(ImportError::locked(&job.module, Some(holder)));
        }

        let job = jobs.get_mut(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn all_active_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<ImportJob>, ImportError> {
        let mut jobs: Vec<ImportJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.user_id == user_id && j.is_current())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn scheduled_jobs(&self, limit: usize) -> Result<Vec<ImportJob>, ImportError> {
        let mut jobs: Vec<ImportJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Scheduled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn finalize(&self, job_id: Uuid, counts: &ImportCounts) -> Result<bool, ImportError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
        if job.is_finished() {
            return Ok(false);
        }

        let now = Utc::now();
        job.status = JobStatus::Halted;
        job.finished_at = Some(now);
        job.updated_at = now;
        job.total_count = Some(counts.total as i32);
        job.created_count = Some(counts.created as i32);
        job.failed_count = Some(counts.failed as i32);
        job.skipped_count = Some(counts.skipped as i32);
        Ok(true)
    }

    async fn mark_undone(&self, job_id: Uuid) -> Result<bool, ImportError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&job_id).ok_or(ImportError::JobNotFound(job_id))?;
        if !job.is_finished() || job.is_undone() {
            return Ok(false);
        }
        job.undone_at = Some(Utc::now());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MergePolicy;

    fn new_job(user_id: Uuid, module: &str) -> NewImportJob {
        NewImportJob {
            user_id,
            module: module.to_string(),
            source_class: "CsvSource".to_string(),
            field_mapping: NewImportJob::mapping_for(&["lastname".to_string()]),
            merge_policy: MergePolicy::Skip,
        }
    }

    fn done() -> ImportCounts {
        ImportCounts { total: 1, created: 1, failed: 0, skipped: 0 }
    }

    #[tokio::test]
    async fn test_second_enqueue_is_locked_until_first_is_done() {
        let queue = MemoryImportQueue::new();
        let user = Uuid::new_v4();

        let first = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();
        let err = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap_err();
        match err {
            ImportError::Locked { module, job_id } => {
                assert_eq!(module, "Contacts");
                assert_eq!(job_id, Some(first.id));
            }
            other => panic!("expected Locked, got {:?}", other),
        }

        queue.claim_for_run(first.id).await.unwrap();
        assert!(queue.finalize(first.id, &done()).await.unwrap());

        let second = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_lock_is_per_user_and_module() {
        let queue = MemoryImportQueue::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        queue.enqueue(new_job(alice, "Contacts"), JobStatus::None).await.unwrap();
        queue.enqueue(new_job(alice, "Accounts"), JobStatus::Scheduled).await.unwrap();
        queue.enqueue(new_job(bob, "Contacts"), JobStatus::None).await.unwrap();

        assert_eq!(queue.all_active_jobs_for_user(alice).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_happens_exactly_once() {
        let queue = MemoryImportQueue::new();
        let job = queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::None).await.unwrap();

        assert!(queue.finalize(job.id, &done()).await.unwrap());
        assert!(!queue.finalize(job.id, &ImportCounts::default()).await.unwrap());

        let job = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Halted);
        assert_eq!(job.final_counts(), Some(done()));
    }

    #[tokio::test]
    async fn test_claim_refuses_running_and_finished_jobs() {
        let queue = MemoryImportQueue::new();
        let job = queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::Scheduled).await.unwrap();

        let claimed = queue.claim_for_run(job.id).await.unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(matches!(queue.claim_for_run(job.id).await, Err(ImportError::Locked { .. })));

        queue.finalize(job.id, &done()).await.unwrap();
        assert!(matches!(queue.claim_for_run(job.id).await, Err(ImportError::InvalidInput(_))));
        assert!(matches!(
            queue.claim_for_run(Uuid::new_v4()).await,
            Err(ImportError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_halted_job_can_be_reclaimed() {
        let queue = MemoryImportQueue::new();
        let job = queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::None).await.unwrap();
        queue.claim_for_run(job.id).await.unwrap();
        queue.update_status(job.id, JobStatus::Halted).await.unwrap();

        assert_eq!(queue.claim_for_run(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_halted_job_cannot_reclaim_a_taken_module() {
        let queue = MemoryImportQueue::new();
        let user = Uuid::new_v4();
        let old = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();
        queue.update_status(old.id, JobStatus::Halted).await.unwrap();

        let newer = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();

        let old = queue.get(old.id).await.unwrap().unwrap();
        assert!(!old.is_current());
        assert!(queue.claim_for_run(old.id).await.is_err());
        assert!(matches!(
            queue.update_status(old.id, JobStatus::Scheduled).await,
            Err(ImportError::Locked { job_id: Some(id), .. }) if id == newer.id
        ));
    }

    #[tokio::test]
    async fn test_enqueue_supersedes_previous_halted_jobs() {
        let queue = MemoryImportQueue::new();
        let user = Uuid::new_v4();
        let first = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();
        queue.finalize(first.id, &done()).await.unwrap();

        let second = queue.enqueue(new_job(user, "Contacts"), JobStatus::None).await.unwrap();

        let current = queue.all_active_jobs_for_user(user).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, second.id);
        assert_eq!(queue.latest_job("Contacts", user).await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_scheduled_jobs_oldest_first_with_limit() {
        let queue = MemoryImportQueue::new();
        for _ in 0..3 {
            queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::Scheduled).await.unwrap();
        }
        queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::None).await.unwrap();

        let scheduled = queue.scheduled_jobs(2).await.unwrap();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled.iter().all(|j| j.status == JobStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_mark_undone_once_and_only_when_finished() {
        let queue = MemoryImportQueue::new();
        let job = queue.enqueue(new_job(Uuid::new_v4(), "Contacts"), JobStatus::None).await.unwrap();

        assert!(!queue.mark_undone(job.id).await.unwrap());
        queue.finalize(job.id, &done()).await.unwrap();
        assert!(queue.mark_undone(job.id).await.unwrap());
        assert!(!queue.mark_undone(job.id).await.unwrap());
    }
}
