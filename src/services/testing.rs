//! Shared fixtures for service tests

use std::sync::Arc;

use uuid::Uuid;

use super::import_queue::{ImportQueue, MemoryImportQueue};
use super::records::MemoryRecordStore;
use super::staging::{MemoryStagingStore, StagingStore};
use super::Backends;
use crate::types::{ImportJob, JobStatus, MergePolicy, NewImportJob, RowFields, RowStatus};

pub struct Harness {
    pub user_id: Uuid,
    pub queue: Arc<MemoryImportQueue>,
    pub staging: Arc<MemoryStagingStore>,
    pub records: Arc<MemoryRecordStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            user_id: Uuid::new_v4(),
            queue: Arc::new(MemoryImportQueue::new()),
            staging: Arc::new(MemoryStagingStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            queue: self.queue.clone(),
            staging: self.staging.clone(),
            records: self.records.clone(),
        }
    }

    pub async fn stage(&self, module: &str, fields: &[&str], rows: Vec<RowFields>) {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.staging.clear(self.user_id, module, &fields).await.unwrap();
        self.staging.append(self.user_id, module, &fields, &rows).await.unwrap();
    }

    pub async fn enqueue(&self, module: &str, status: JobStatus) -> ImportJob {
        let fields = self.staging.staged_fields(self.user_id, module).await.unwrap();
        self.queue
            .enqueue(
                NewImportJob {
                    user_id: self.user_id,
                    module: module.to_string(),
                    source_class: "TestSource".to_string(),
                    field_mapping: NewImportJob::mapping_for(&fields),
                    merge_policy: MergePolicy::Skip,
                },
                status,
            )
            .await
            .unwrap()
    }

    pub fn statuses(&self, module: &str) -> Vec<RowStatus> {
        self.staging
            .rows(self.user_id, module)
            .iter()
            .map(|r| r.status)
            .collect()
    }
}

pub fn row(pairs: &[(&str, &str)]) -> RowFields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// `n` distinct contacts named L1..Ln
pub fn contacts(n: usize) -> Vec<RowFields> {
    (1..=n)
        .map(|i| {
            row(&[
                ("lastname", &format!("L{}", i)),
                ("firstname", "Jan"),
                ("email", &format!("l{}@example.com", i)),
            ])
        })
        .collect()
}

pub const CONTACT_FIELDS: [&str; 3] = ["lastname", "firstname", "email"];
