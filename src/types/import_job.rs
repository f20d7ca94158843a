//! Import job types
//!
//! One `ImportJob` tracks one attempt to import every staged row of a
//! module for a user. At most one job per (user, module) may hold the
//! module at a time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::ImportCounts;

/// Field name -> ordinal column index in the staging table
pub type FieldMapping = BTreeMap<String, usize>;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "import_job_status", rename_all = "snake_case")]
pub enum JobStatus {
    None,
    Running,
    Scheduled,
    Halted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "none",
            JobStatus::Running => "running",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Halted => "halted",
        }
    }

    /// Whether a job in this status holds the (user, module) lock.
    ///
    /// `None` counts: a freshly enqueued job holds the module until it is
    /// either scheduled or run.
    pub fn holds_lock(&self) -> bool {
        matches!(self, JobStatus::None | JobStatus::Running | JobStatus::Scheduled)
    }
}

/// What to do when a row resolves to an entity that already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "import_merge_policy", rename_all = "snake_case")]
pub enum MergePolicy {
    /// Leave the existing entity untouched
    #[default]
    Skip,
    /// Replace existing values with the row's values
    Overwrite,
    /// Only fill values the existing entity does not have
    Merge,
}

/// Persisted import job
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module: String,
    /// Identifier of the import source that staged the rows
    pub source_class: String,
    pub field_mapping: Json<FieldMapping>,
    pub merge_policy: MergePolicy,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once by the status reporter when every row is terminal
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a newer job for the same (user, module) replaced this one
    pub superseded_at: Option<DateTime<Utc>>,
    pub undone_at: Option<DateTime<Utc>>,
    pub total_count: Option<i32>,
    pub created_count: Option<i32>,
    pub failed_count: Option<i32>,
    pub skipped_count: Option<i32>,
}

impl ImportJob {
    /// Staging columns in mapping order
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<(&String, &usize)> = self.field_mapping.0.iter().collect();
        fields.sort_by_key(|(_, index)| **index);
        fields.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Still listed among the user's current imports. Finished jobs stay
    /// current until the next import of the same module replaces them.
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    pub fn is_undone(&self) -> bool {
        self.undone_at.is_some()
    }

    /// Final counts recorded at finalization
    pub fn final_counts(&self) -> Option<ImportCounts> {
        let count = |value: Option<i32>| value.map(|v| v.max(0) as u64);
        Some(ImportCounts {
            total: count(self.total_count)?,
            created: count(self.created_count)?,
            failed: count(self.failed_count)?,
            skipped: count(self.skipped_count)?,
        })
    }
}

/// Parameters for a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewImportJob {
    pub user_id: Uuid,
    pub module: String,
    pub source_class: String,
    pub field_mapping: FieldMapping,
    pub merge_policy: MergePolicy,
}

impl NewImportJob {
    /// Build the mapping from the module's ordered field list
    pub fn mapping_for(fields: &[String]) -> FieldMapping {
        fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.clone(), index))
            .collect()
    }

    pub fn into_job(self, status: JobStatus) -> ImportJob {
        let now = Utc::now();
        ImportJob {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            module: self.module,
            source_class: self.source_class,
            field_mapping: Json(self.field_mapping),
            merge_policy: self.merge_policy,
            status,
            created_at: now,
            updated_at: now,
            finished_at: None,
            superseded_at: None,
            undone_at: None,
            total_count: None,
            created_count: None,
            failed_count: None,
            skipped_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mapping_follows_field_order() {
        let mapping = NewImportJob::mapping_for(&fields(&["lastname", "firstname", "email"]));
        assert_eq!(mapping["lastname"], 0);
        assert_eq!(mapping["firstname"], 1);
        assert_eq!(mapping["email"], 2);
    }

    #[test]
    fn test_job_fields_are_returned_in_index_order() {
        let job = NewImportJob {
            user_id: Uuid::new_v4(),
            module: "Contacts".to_string(),
            source_class: "CsvContacts".to_string(),
            field_mapping: NewImportJob::mapping_for(&fields(&["zeta", "alpha", "mid"])),
            merge_policy: MergePolicy::Skip,
        }
        .into_job(JobStatus::None);

        assert_eq!(job.fields(), fields(&["zeta", "alpha", "mid"]));
        assert!(job.is_current());
        assert!(!job.is_finished());
    }

    #[test]
    fn test_lock_holding_statuses() {
        assert!(JobStatus::None.holds_lock());
        assert!(JobStatus::Running.holds_lock());
        assert!(JobStatus::Scheduled.holds_lock());
        assert!(!JobStatus::Halted.holds_lock());
    }

    #[test]
    fn test_merge_policy_defaults_to_skip() {
        assert_eq!(MergePolicy::default(), MergePolicy::Skip);
        let json = serde_json::to_string(&MergePolicy::Overwrite).unwrap();
        assert_eq!(json, "\"overwrite\"");
    }

    #[test]
    fn test_import_job_serializes_to_camel_case() {
        let job = NewImportJob {
            user_id: Uuid::nil(),
            module: "Contacts".to_string(),
            source_class: "CsvContacts".to_string(),
            field_mapping: FieldMapping::new(),
            merge_policy: MergePolicy::Merge,
        }
        .into_job(JobStatus::Scheduled);

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("sourceClass"));
        assert!(json.contains("fieldMapping"));
        assert!(json.contains("\"status\":\"scheduled\""));
    }
}
