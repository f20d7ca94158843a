//! Undo engine
//!
//! Deletes the records a finished job created. Deletion is per record and
//! not transactional: the report counts only confirmed deletions.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::records::{RecordAction, RecordStore};
use super::staging::StagingStore;
use super::strategy::StrategyRegistry;
use super::Backends;
use crate::config::ImportSettings;
use crate::defaults::INVENTORY_GROUP_FIELD;
use crate::error::ImportError;
use crate::types::{CreatedRow, ImportJob, UndoReport};

pub use super::records::SaveMode;

/// Everything an undo routine needs for one job
pub struct UndoContext {
    pub job: ImportJob,
    pub staging: Arc<dyn StagingStore>,
    pub records: Arc<dyn RecordStore>,
    /// Column rows are grouped by before deletion, for inventory modules
    pub group_field: Option<String>,
    pub mode: SaveMode,
}

/// Collapse rows sharing a group key to the first of them. Rows without a
/// key stay individual.
pub fn undo_candidates(rows: Vec<CreatedRow>) -> Vec<CreatedRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match &row.group_key {
            Some(key) => seen.insert(key.clone()),
            None => true,
        })
        .collect()
}

/// Delete every CREATED row's record the user may delete
pub async fn default_undo(ctx: &UndoContext) -> Result<UndoReport, ImportError> {
    let job = &ctx.job;
    let rows = ctx
        .staging
        .created_rows(job.user_id, &job.module, ctx.group_field.as_deref())
        .await?;
    let candidates = undo_candidates(rows);

    let mut deleted = 0u64;
    for candidate in &candidates {
        let record_id = candidate.record_id;
        if !ctx.records.exists(&job.module, record_id).await? {
            debug!(job_id = %job.id, %record_id, "Record already gone, nothing to undo");
            continue;
        }
        let permitted = ctx
            .records
            .is_permitted(job.user_id, &job.module, RecordAction::Delete, record_id)
            .await?;
        if !permitted {
            debug!(job_id = %job.id, %record_id, "Delete not permitted, record kept");
            continue;
        }

        match ctx.records.delete(&job.module, record_id, ctx.mode).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(job_id = %job.id, %record_id, error = %e, "Failed to delete imported record"),
        }
    }

    Ok(UndoReport {
        job_id: job.id,
        module: job.module.clone(),
        total_records: candidates.len() as u64,
        deleted,
    })
}

pub struct UndoEngine {
    backends: Backends,
    strategies: Arc<StrategyRegistry>,
    settings: ImportSettings,
}

impl UndoEngine {
    pub fn new(backends: Backends, strategies: Arc<StrategyRegistry>, settings: ImportSettings) -> Self {
        Self {
            backends,
            strategies,
            settings,
        }
    }

    /// Undo the user's latest finished import of every module in `modules`.
    ///
    /// `modules` is in import order. Every module must pass the guards
    /// before anything is deleted; the modules are then undone in reverse
    /// order and the reports returned in that order.
    pub async fn undo(&self, user_id: Uuid, modules: &[String]) -> Result<Vec<UndoReport>, ImportError> {
        let mut jobs = Vec::with_capacity(modules.len());
        for module in modules {
            jobs.push(self.undoable_job(user_id, module).await?);
        }

        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs.iter().rev() {
            reports.push(self.undo_checked(job).await?);
        }
        Ok(reports)
    }

    /// The job an undo of `module` would revert, after every guard passed
    async fn undoable_job(&self, user_id: Uuid, module: &str) -> Result<ImportJob, ImportError> {
        let queue = &self.backends.queue;
        if let Some(active) = queue.get_active_job(module, user_id).await? {
            return Err(ImportError::locked(module, Some(active.id)));
        }

        let job = queue
            .latest_job(module, user_id)
            .await?
            .ok_or(ImportError::Interrupted)?;
        if !job.is_finished() {
            return Err(ImportError::NotFinished(job.id));
        }
        if job.is_undone() {
            return Err(ImportError::AlreadyUndone(job.id));
        }

        let permitted = self
            .backends
            .records
            .has_module_permission(user_id, module, RecordAction::Delete)
            .await?;
        if !permitted {
            return Err(ImportError::PermissionDenied {
                module: module.to_string(),
                action: RecordAction::Delete,
            });
        }
        Ok(job)
    }

    /// Mark a job returned by `undoable_job` undone, then revert it
    async fn undo_checked(&self, job: &ImportJob) -> Result<UndoReport, ImportError> {
        if !self.backends.queue.mark_undone(job.id).await? {
            return Err(ImportError::AlreadyUndone(job.id));
        }
        self.undo_job(job).await
    }

    /// Run the module's undo routine for `job` without any guard
    pub async fn undo_job(&self, job: &ImportJob) -> Result<UndoReport, ImportError> {
        let group_field = (self.settings.is_inventory_module(&job.module)
            && job.field_mapping.0.contains_key(INVENTORY_GROUP_FIELD))
        .then(|| INVENTORY_GROUP_FIELD.to_string());

        let ctx = UndoContext {
            job: job.clone(),
            staging: self.backends.staging.clone(),
            records: self.backends.records.clone(),
            group_field,
            mode: SaveMode::Interactive,
        };

        let strategy = self.strategies.strategy_for(&job.module);
        let report = strategy.undo(&ctx).await?;
        info!(
            job_id = %job.id, user_id = %job.user_id, module = %job.module,
            total = report.total_records, deleted = report.deleted,
            "Import undone"
        );
        Ok(report)
    }
}
