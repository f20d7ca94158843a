//! Status reporter
//!
//! Derives the phase and counts of jobs and composes the status page the
//! presentation layer renders. Reaching DONE finalizes the job.

use tracing::info;
use uuid::Uuid;

use super::Backends;
use crate::error::ImportError;
use crate::types::{
    ImportCounts, ImportJob, ImportPhase, ImportSummary, JobStatus, StatusPage, View, ViewTemplate,
};

#[derive(Clone)]
pub struct StatusReporter {
    backends: Backends,
}

impl StatusReporter {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// Counts recorded at finalization, or live staging counts before that
    async fn counts_for(&self, job: &ImportJob) -> Result<ImportCounts, ImportError> {
        match job.final_counts() {
            Some(counts) => Ok(counts),
            None => self.backends.staging.status_counts(job.user_id, &job.module).await,
        }
    }

    pub async fn summarize(&self, job: &ImportJob) -> Result<ImportSummary, ImportError> {
        let counts = self.counts_for(job).await?;
        let phase = ImportPhase::derive(job.status, &counts);
        let mut status = job.status;

        if phase == ImportPhase::Done && !job.is_finished() {
            if self.backends.queue.finalize(job.id, &counts).await? {
                info!(
                    job_id = %job.id, user_id = %job.user_id, module = %job.module,
                    total = counts.total, created = counts.created, failed = counts.failed, skipped = counts.skipped,
                    "Import job finalized"
                );
            }
            status = JobStatus::Halted;
        }

        Ok(ImportSummary {
            job_id: job.id,
            user_id: job.user_id,
            module: job.module.clone(),
            status,
            merge_policy: job.merge_policy,
            phase,
            counts,
            can_continue: phase != ImportPhase::Done
                && matches!(status, JobStatus::Scheduled | JobStatus::Halted),
        })
    }

    /// Header, one view per current job, then the button view.
    ///
    /// A user without current jobs gets `Interrupted`.
    pub async fn status_page(&self, user_id: Uuid) -> Result<StatusPage, ImportError> {
        let jobs = self.backends.queue.all_active_jobs_for_user(user_id).await?;
        if jobs.is_empty() {
            return Err(ImportError::Interrupted);
        }

        let mut page = StatusPage::default();
        page.push(View::new(ViewTemplate::ImportHeader).assign("IMPORT_COUNT", jobs.len()));

        let mut all_done = true;
        for job in &jobs {
            let summary = self.summarize(job).await?;
            all_done &= summary.phase == ImportPhase::Done;
            page.push(job_view(job, &summary));
        }

        let buttons = if all_done {
            ViewTemplate::EndedImportButtons
        } else {
            ViewTemplate::ImportDoneButtons
        };
        page.push(View::new(buttons));
        Ok(page)
    }
}

fn job_view(job: &ImportJob, summary: &ImportSummary) -> View {
    let base = |template| {
        View::new(template)
            .assign("FOR_MODULE", &summary.module)
            .assign("IMPORT_ID", summary.job_id)
            .assign("IMPORT_RESULT", summary.counts)
    };

    match summary.phase {
        ImportPhase::RunningPartial => base(ViewTemplate::ImportStatus)
            .assign("CONTINUE_IMPORT", summary.can_continue),
        ImportPhase::ScheduledWaiting => {
            let view = base(ViewTemplate::ImportSchedule).assign("CONTINUE_IMPORT", summary.can_continue);
            if summary.counts.processed() > 0 {
                view.assign("SHOW_DETAILS", true)
            } else {
                view
            }
        }
        ImportPhase::Done => base(ViewTemplate::ImportResult)
            .assign("OWNER_ID", summary.user_id)
            .assign("MERGE_POLICY", summary.merge_policy)
            .assign("UNDONE", job.is_undone())
            .assign("UNDO_AVAILABLE", !job.is_undone() && summary.counts.created > 0),
    }
}
