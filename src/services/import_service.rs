//! Import service
//!
//! Entry points behind the NATS handlers and the CLI. Owns the executor,
//! the status reporter and the undo engine over one set of backends.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::executor::ImportExecutor;
use super::records::RecordAction;
use super::staging::parse_csv_rows;
use super::status_reporter::StatusReporter;
use super::strategy::StrategyRegistry;
use super::undo::UndoEngine;
use super::Backends;
use crate::config::ImportSettings;
use crate::error::ImportError;
use crate::types::{
    ImportJob, JobStatus, NewImportJob, PreviewResponse, ScheduledRunReport, StageRowsRequest,
    StageRowsResponse, StartImportRequest, StatusPage, UndoImportRequest, View, ViewTemplate,
};

/// The modules an import or undo covers, in import order. An empty list
/// means the main module alone; a non-empty list must name it.
fn import_modules(main: &str, modules: &[String]) -> Result<Vec<String>, ImportError> {
    let main = main.trim();
    if main.is_empty() {
        return Err(ImportError::InvalidInput("module is required".into()));
    }
    if modules.is_empty() {
        return Ok(vec![main.to_string()]);
    }

    let mut listed: Vec<String> = Vec::with_capacity(modules.len());
    for module in modules {
        let module = module.trim();
        if listed.iter().any(|m| m == module) {
            return Err(ImportError::InvalidInput(format!("module {} is listed twice", module)));
        }
        listed.push(module.to_string());
    }
    if !listed.iter().any(|m| m == main) {
        return Err(ImportError::InvalidInput(format!("main module {} is not among the import modules", main)));
    }
    Ok(listed)
}

pub struct ImportService {
    backends: Backends,
    strategies: Arc<StrategyRegistry>,
    settings: ImportSettings,
    executor: ImportExecutor,
    reporter: StatusReporter,
    undo: UndoEngine,
}

impl ImportService {
    pub fn new(backends: Backends, strategies: Arc<StrategyRegistry>, settings: ImportSettings) -> Self {
        let executor = ImportExecutor::new(backends.clone(), strategies.clone(), settings.clone());
        let reporter = StatusReporter::new(backends.clone());
        let undo = UndoEngine::new(backends.clone(), strategies.clone(), settings.clone());
        Self {
            backends,
            strategies,
            settings,
            executor,
            reporter,
            undo,
        }
    }

    async fn require_permission(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
    ) -> Result<(), ImportError> {
        let permitted = self
            .backends
            .records
            .has_module_permission(user_id, module, action)
            .await?;
        if !permitted {
            return Err(ImportError::PermissionDenied {
                module: module.to_string(),
                action,
            });
        }
        Ok(())
    }

    /// Replace the user's staging area for a module with the request's rows
    pub async fn stage(&self, user_id: Uuid, request: StageRowsRequest) -> Result<StageRowsResponse, ImportError> {
        let module = request.module.trim().to_string();
        if module.is_empty() {
            return Err(ImportError::InvalidInput("module is required".into()));
        }
        self.require_permission(user_id, &module, RecordAction::Import).await?;
        if let Some(active) = self.backends.queue.get_active_job(&module, user_id).await? {
            return Err(ImportError::locked(&module, Some(active.id)));
        }

        let mut rows = request.rows;
        let mut csv_headers = Vec::new();
        if let Some(content) = request.csv_content.as_deref() {
            let (headers, parsed) = parse_csv_rows(content)?;
            csv_headers = headers;
            rows.extend(parsed);
        }

        let fields = if !request.fields.is_empty() {
            request.fields
        } else if !csv_headers.is_empty() {
            csv_headers
        } else if let Some(fields) = self.strategies.fields_for(&module) {
            fields
        } else {
            let keys: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
            keys.into_iter().cloned().collect()
        };

        let staging = &self.backends.staging;
        staging.clear(user_id, &module, &fields).await?;
        let staged = staging.append(user_id, &module, &fields, &rows).await?;
        info!(%user_id, %module, staged, fields = fields.len(), "Rows staged for import");

        Ok(StageRowsResponse { module, staged })
    }

    /// First pending rows plus the number of rows an import would process
    pub async fn preview(&self, user_id: Uuid, module: &str) -> Result<PreviewResponse, ImportError> {
        let staging = &self.backends.staging;
        let fields = staging.staged_fields(user_id, module).await?;
        let counts = staging.status_counts(user_id, module).await?;
        let rows = if fields.is_empty() {
            Vec::new()
        } else {
            staging
                .preview(user_id, module, &fields, self.settings.preview_limit)
                .await?
        };

        Ok(PreviewResponse {
            module: module.to_string(),
            importable_rows_count: counts.pending(),
            rows: rows.into_iter().map(|row| row.fields).collect(),
        })
    }

    /// Create a job per import module for the staged rows. Small imports
    /// run right away, module by module in the listed order; larger ones are
    /// left SCHEDULED for the scheduler.
    pub async fn import(&self, user_id: Uuid, request: StartImportRequest) -> Result<StatusPage, ImportError> {
        let modules = import_modules(&request.module, &request.modules)?;
        let staging = &self.backends.staging;

        let mut planned = Vec::with_capacity(modules.len());
        let mut staged = 0;
        let mut pending = 0;
        for module in &modules {
            self.require_permission(user_id, module, RecordAction::Import).await?;
            if let Some(active) = self.backends.queue.get_active_job(module, user_id).await? {
                return Err(ImportError::locked(module, Some(active.id)));
            }
            let fields = staging.staged_fields(user_id, module).await?;
            if fields.is_empty() {
                return Err(ImportError::InvalidInput(format!("no rows staged for {}", module)));
            }
            let counts = staging.status_counts(user_id, module).await?;
            staged += counts.total;
            pending += counts.pending();
            planned.push(NewImportJob {
                user_id,
                module: module.clone(),
                source_class: request.source.clone(),
                field_mapping: NewImportJob::mapping_for(&fields),
                merge_policy: request.merge_policy,
            });
        }
        if staged == 0 {
            return Err(ImportError::InvalidInput(format!("no rows staged for {}", request.module)));
        }

        let status = if pending > self.settings.immediate_limit {
            JobStatus::Scheduled
        } else {
            JobStatus::None
        };
        let mut jobs = Vec::with_capacity(planned.len());
        for new_job in planned {
            match self.backends.queue.enqueue(new_job, status).await {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    self.release(&jobs).await;
                    return Err(e);
                }
            }
        }
        for job in &jobs {
            info!(
                job_id = %job.id, %user_id, module = %job.module, status = job.status.as_str(),
                pending,
                "Import job created"
            );
        }

        if status == JobStatus::None {
            for (index, job) in jobs.iter().enumerate() {
                if let Err(e) = self.executor.run(job.id).await {
                    self.release(&jobs[index + 1..]).await;
                    return Err(e);
                }
            }
        }
        self.show_status(user_id).await
    }

    /// Move jobs that will not run now to HALTED so they stop holding their
    /// module; they stay current and can be continued
    async fn release(&self, jobs: &[ImportJob]) {
        for job in jobs {
            if let Err(e) = self.backends.queue.update_status(job.id, JobStatus::Halted).await {
                error!(job_id = %job.id, module = %job.module, error = %e, "Failed to release import job");
            }
        }
    }

    /// Run a SCHEDULED or HALTED job of the user now
    pub async fn continue_import(&self, user_id: Uuid, job_id: Uuid) -> Result<StatusPage, ImportError> {
        let job = self
            .backends
            .queue
            .get(job_id)
            .await?
            .filter(|job| job.user_id == user_id)
            .ok_or(ImportError::JobNotFound(job_id))?;

        self.executor.run(job.id).await?;
        self.show_status(user_id).await
    }

    /// Undo the latest import of every requested module, last module first
    pub async fn undo(&self, user_id: Uuid, request: UndoImportRequest) -> Result<StatusPage, ImportError> {
        let modules = import_modules(&request.module, &request.modules)?;
        let reports = self.undo.undo(user_id, &modules).await?;

        let mut page = StatusPage::default();
        for report in reports {
            page.push(
                View::new(ViewTemplate::ImportUndoResult)
                    .assign("FOR_MODULE", &report.module)
                    .assign("TOTAL_RECORDS", report.total_records)
                    .assign("DELETED_RECORDS_COUNT", report.deleted),
            );
        }
        Ok(page)
    }

    pub async fn show_status(&self, user_id: Uuid) -> Result<StatusPage, ImportError> {
        self.reporter.status_page(user_id).await
    }

    /// Resume up to `limit` SCHEDULED jobs, oldest first
    pub async fn run_scheduled(&self, limit: usize) -> Result<ScheduledRunReport, ImportError> {
        let jobs = self.backends.queue.scheduled_jobs(limit).await?;
        let mut report = ScheduledRunReport::default();

        for job in jobs {
            report.attempted += 1;
            match self.executor.run(job.id).await {
                Ok(counts) if counts.is_complete() => report.completed += 1,
                Ok(counts) => {
                    warn!(job_id = %job.id, pending = counts.pending(), "Scheduled import left rows pending");
                    report.halted += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, module = %job.module, error = %e, "Scheduled import failed");
                    report.halted += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted, completed = report.completed, halted = report.halted,
                "Scheduled imports processed"
            );
        }
        Ok(report)
    }
}
