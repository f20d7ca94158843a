//! Import job queries over `crm_import_jobs`
//!
//! Lock-holding statuses are guarded by the partial unique index
//! `crm_import_jobs_active_uniq`, so every transition into `none`,
//! `running` or `scheduled` is a single statement that either wins the
//! lock or fails with a unique violation.

use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ImportError;
use crate::types::{ImportCounts, ImportJob, JobStatus, NewImportJob};

const JOB_COLUMNS: &str = r#"
    id, user_id, module, source_class, field_mapping, merge_policy, status,
    created_at, updated_at, finished_at, superseded_at, undone_at,
    total_count, created_count, failed_count, skipped_count
"#;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Map a lock conflict to `Locked`, naming the job that holds the module
async fn lock_conflict(pool: &PgPool, user_id: Uuid, module: &str, err: sqlx::Error) -> ImportError {
    if !is_unique_violation(&err) {
        return ImportError::Database(err);
    }
    let holder = get_active_job(pool, user_id, module).await.ok().flatten();
    ImportError::locked(module, holder.map(|job| job.id))
}

/// Insert a job, retiring earlier HALTED jobs of the same (user, module)
pub async fn insert_job(
    pool: &PgPool,
    new_job: &NewImportJob,
    status: JobStatus,
) -> Result<ImportJob, ImportError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE crm_import_jobs
        SET superseded_at = NOW(), updated_at = NOW()
        WHERE user_id = $1 AND module = $2 AND status = 'halted' AND superseded_at IS NULL
        "#,
    )
    .bind(new_job.user_id)
    .bind(&new_job.module)
    .execute(&mut *tx)
    .await?;

    let inserted = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        INSERT INTO crm_import_jobs (id, user_id, module, source_class, field_mapping, merge_policy, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(new_job.user_id)
    .bind(&new_job.module)
    .bind(&new_job.source_class)
    .bind(Json(&new_job.field_mapping))
    .bind(new_job.merge_policy)
    .bind(status)
    .fetch_one(&mut *tx)
    .await;

    match inserted {
        Ok(job) => {
            tx.commit().await?;
            Ok(job)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(lock_conflict(pool, new_job.user_id, &new_job.module, err).await)
        }
    }
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
    let job = sqlx::query_as::<_, ImportJob>(&format!(
        "SELECT {} FROM crm_import_jobs WHERE id = $1",
        JOB_COLUMNS
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

/// The lock-holding job of a (user, module), if any
pub async fn get_active_job(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
) -> Result<Option<ImportJob>, ImportError> {
    let job = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        SELECT {} FROM crm_import_jobs
        WHERE user_id = $1 AND module = $2 AND status IN ('none', 'running', 'scheduled')
        "#,
        JOB_COLUMNS
    ))
    .bind(user_id)
    .bind(module)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

/// Most recent current job of a (user, module), whatever its status
pub async fn get_latest_job(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
) -> Result<Option<ImportJob>, ImportError> {
    let job = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        SELECT {} FROM crm_import_jobs
        WHERE user_id = $1 AND module = $2 AND superseded_at IS NULL
        ORDER BY created_at DESC
        LIMIT 1
        "#,
        JOB_COLUMNS
    ))
    .bind(user_id)
    .bind(module)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

pub async fn list_current_jobs(pool: &PgPool, user_id: Uuid) -> Result<Vec<ImportJob>, ImportError> {
    let jobs = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        SELECT {} FROM crm_import_jobs
        WHERE user_id = $1 AND superseded_at IS NULL
        ORDER BY created_at
        "#,
        JOB_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Oldest SCHEDULED jobs first
pub async fn list_scheduled_jobs(pool: &PgPool, limit: usize) -> Result<Vec<ImportJob>, ImportError> {
    let jobs = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        SELECT {} FROM crm_import_jobs
        WHERE status = 'scheduled'
        ORDER BY created_at
        LIMIT $1
        "#,
        JOB_COLUMNS
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

pub async fn set_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<Option<ImportJob>, ImportError> {
    let updated = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        UPDATE crm_import_jobs
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(job_id)
    .bind(status)
    .fetch_optional(pool)
    .await;

    match updated {
        Ok(job) => Ok(job),
        Err(err) => {
            let job = get_job(pool, job_id).await?.ok_or(ImportError::JobNotFound(job_id))?;
            Err(lock_conflict(pool, job.user_id, &job.module, err).await)
        }
    }
}

/// Move an unfinished job to RUNNING. Returns `None` when the job is not
/// claimable (missing, finished, superseded or already running).
pub async fn claim_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>, ImportError> {
    let claimed = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        UPDATE crm_import_jobs
        SET status = 'running', updated_at = NOW()
        WHERE id = $1
          AND status IN ('none', 'scheduled', 'halted')
          AND finished_at IS NULL
          AND superseded_at IS NULL
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await;

    match claimed {
        Ok(job) => Ok(job),
        Err(err) => {
            let job = get_job(pool, job_id).await?.ok_or(ImportError::JobNotFound(job_id))?;
            Err(lock_conflict(pool, job.user_id, &job.module, err).await)
        }
    }
}

/// Record final counts and release the module. Only the first call for a
/// job has any effect.
pub async fn finalize_job(pool: &PgPool, job_id: Uuid, counts: &ImportCounts) -> Result<bool, ImportError> {
    let result = sqlx::query(
        r#"
        UPDATE crm_import_jobs
        SET status = 'halted',
            finished_at = NOW(),
            updated_at = NOW(),
            total_count = $2,
            created_count = $3,
            failed_count = $4,
            skipped_count = $5
        WHERE id = $1 AND finished_at IS NULL
        "#,
    )
    .bind(job_id)
    .bind(counts.total as i32)
    .bind(counts.created as i32)
    .bind(counts.failed as i32)
    .bind(counts.skipped as i32)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_undone(pool: &PgPool, job_id: Uuid) -> Result<bool, ImportError> {
    let result = sqlx::query(
        r#"
        UPDATE crm_import_jobs
        SET undone_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND finished_at IS NOT NULL AND undone_at IS NULL
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
