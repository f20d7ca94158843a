//! Import pipeline services
//!
//! Storage seams (`ImportQueue`, `StagingStore`, `RecordStore`) each have a
//! Postgres implementation and an in-memory one used when no database is
//! configured and in tests.

pub mod dedup_cache;
pub mod executor;
pub mod import_queue;
pub mod import_service;
pub mod records;
pub mod scheduler;
pub mod staging;
pub mod status_reporter;
pub mod strategy;
pub mod undo;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use sqlx::PgPool;

use import_queue::{ImportQueue, MemoryImportQueue, PgImportQueue};
use records::{MemoryRecordStore, PgRecordStore, RecordStore};
use staging::{MemoryStagingStore, PgStagingStore, StagingStore};

/// The storage collaborators shared by every import component
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn ImportQueue>,
    pub staging: Arc<dyn StagingStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Backends {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            queue: Arc::new(PgImportQueue::new(pool.clone())),
            staging: Arc::new(PgStagingStore::new(pool.clone())),
            records: Arc::new(PgRecordStore::new(pool)),
        }
    }

    /// Everything in process memory; lost on restart
    pub fn in_memory() -> Self {
        Self {
            queue: Arc::new(MemoryImportQueue::new()),
            staging: Arc::new(MemoryStagingStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.records.name()
    }
}
