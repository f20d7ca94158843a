//! Import progress types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::import_job::{JobStatus, MergePolicy};

/// Row counts of one staging table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounts {
    pub total: u64,
    pub created: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ImportCounts {
    /// Rows that reached a terminal status
    pub fn processed(&self) -> u64 {
        self.created + self.failed + self.skipped
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }

    pub fn is_complete(&self) -> bool {
        self.processed() == self.total
    }
}

/// Human-facing phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportPhase {
    ScheduledWaiting,
    RunningPartial,
    Done,
}

impl ImportPhase {
    /// Done iff every row is terminal, otherwise derived from the job status
    pub fn derive(status: JobStatus, counts: &ImportCounts) -> Self {
        if counts.is_complete() {
            ImportPhase::Done
        } else if status == JobStatus::Scheduled {
            ImportPhase::ScheduledWaiting
        } else {
            ImportPhase::RunningPartial
        }
    }
}

/// Summary of one job as shown to the user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub module: String,
    pub status: JobStatus,
    pub merge_policy: MergePolicy,
    pub phase: ImportPhase,
    pub counts: ImportCounts,
    /// Scheduled or halted jobs can be resumed by the user
    pub can_continue: bool,
}

/// Outcome of one undo
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoReport {
    pub job_id: Uuid,
    pub module: String,
    /// Candidate records after grouping
    pub total_records: u64,
    /// Records confirmed deleted
    pub deleted: u64,
}

/// Outcome of a scheduler pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRunReport {
    pub attempted: u32,
    pub completed: u32,
    pub halted: u32,
}
