//! Record persistence collaborator.
//!
//! The import engine only ever talks to CRM records through `RecordStore`.
//! `PgRecordStore` backs it with the generic `crm_records` table,
//! `MemoryRecordStore` keeps everything in a map for dev runs and tests.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::db::queries;
use crate::error::ImportError;
use crate::types::{MergePolicy, RowFields};

/// Permission-checked actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Import,
    Delete,
}

impl RecordAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordAction::Import => "import",
            RecordAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a write is carried out by the record store.
///
/// `Bulk` skips per-record side effects (relation cleanup, events) and is
/// used while importing; `Interactive` behaves like a user-initiated save
/// and is used by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Bulk,
    Interactive,
}

/// Create/update/delete/exists/permission operations on CRM records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(
        &self,
        owner_id: Uuid,
        module: &str,
        fields: &RowFields,
        mode: SaveMode,
    ) -> Result<Uuid, ImportError>;

    /// Apply `fields` to an existing record according to `policy`
    async fn update(
        &self,
        module: &str,
        record_id: Uuid,
        fields: &RowFields,
        policy: MergePolicy,
        mode: SaveMode,
    ) -> Result<(), ImportError>;

    async fn delete(&self, module: &str, record_id: Uuid, mode: SaveMode) -> Result<(), ImportError>;

    async fn exists(&self, module: &str, record_id: Uuid) -> Result<bool, ImportError>;

    /// First live record whose fields equal every `(field, value)` pair,
    /// ignoring case
    async fn find(&self, module: &str, criteria: &[(&str, &str)]) -> Result<Option<Uuid>, ImportError>;

    async fn has_module_permission(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
    ) -> Result<bool, ImportError>;

    async fn is_permitted(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
        record_id: Uuid,
    ) -> Result<bool, ImportError>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

// =============================================================================
// PgRecordStore
// =============================================================================

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(
        &self,
        owner_id: Uuid,
        module: &str,
        fields: &RowFields,
        mode: SaveMode,
    ) -> Result<Uuid, ImportError> {
        let id = queries::records::insert_record(&self.pool, owner_id, module, fields).await?;
        debug!(record_id = %id, module, ?mode, "record created");
        Ok(id)
    }

    async fn update(
        &self,
        module: &str,
        record_id: Uuid,
        fields: &RowFields,
        policy: MergePolicy,
        _mode: SaveMode,
    ) -> Result<(), ImportError> {
        let updated = match policy {
            MergePolicy::Skip => return Ok(()),
            MergePolicy::Overwrite => {
                queries::records::overwrite_fields(&self.pool, module, record_id, fields).await?
            }
            MergePolicy::Merge => {
                queries::records::fill_missing_fields(&self.pool, module, record_id, fields).await?
            }
        };
        if !updated {
            return Err(ImportError::Collaborator(format!("{} record {} not found", module, record_id)));
        }
        Ok(())
    }

    async fn delete(&self, module: &str, record_id: Uuid, mode: SaveMode) -> Result<(), ImportError> {
        if !queries::records::mark_deleted(&self.pool, module, record_id).await? {
            return Err(ImportError::Collaborator(format!("{} record {} not found", module, record_id)));
        }
        if mode == SaveMode::Interactive {
            queries::records::delete_relations(&self.pool, record_id).await?;
        }
        Ok(())
    }

    async fn exists(&self, module: &str, record_id: Uuid) -> Result<bool, ImportError> {
        Ok(queries::records::record_exists(&self.pool, module, record_id).await?)
    }

    async fn find(&self, module: &str, criteria: &[(&str, &str)]) -> Result<Option<Uuid>, ImportError> {
        Ok(queries::records::find_by_fields(&self.pool, module, criteria).await?)
    }

    async fn has_module_permission(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
    ) -> Result<bool, ImportError> {
        Ok(queries::records::has_module_permission(&self.pool, user_id, module, action.as_str()).await?)
    }

    async fn is_permitted(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
        record_id: Uuid,
    ) -> Result<bool, ImportError> {
        Ok(queries::records::is_record_permitted(&self.pool, user_id, module, action.as_str(), record_id).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// =============================================================================
// MemoryRecordStore
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub module: String,
    pub owner_id: Uuid,
    pub fields: RowFields,
    pub deleted: bool,
}

#[derive(Default)]
struct MemoryRecords {
    records: HashMap<Uuid, MemoryRecord>,
    /// Explicit grants; ignored when `open_access` is set
    grants: HashSet<(Uuid, String, RecordAction)>,
    open_access: bool,
    /// Creating a record with this (field, value) fails as a store outage
    fail_create: Option<(String, String)>,
    denied_records: HashSet<Uuid>,
    delete_log: Vec<(Uuid, SaveMode)>,
}

/// In-memory record store for dev runs without a database and for tests
pub struct MemoryRecordStore {
    state: Mutex<MemoryRecords>,
}

impl MemoryRecordStore {
    /// Store where every user may do everything
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryRecords {
                open_access: true,
                ..Default::default()
            }),
        }
    }

    /// Store where only explicit grants are permitted
    #[cfg(test)]
    pub fn restricted() -> Self {
        Self {
            state: Mutex::new(MemoryRecords::default()),
        }
    }

    #[cfg(test)]
    pub fn grant(&self, user_id: Uuid, module: &str, action: RecordAction) {
        self.state.lock().grants.insert((user_id, module.to_string(), action));
    }

    /// Deny per-record permission on one record
    #[cfg(test)]
    pub fn deny_record(&self, record_id: Uuid) {
        self.state.lock().denied_records.insert(record_id);
    }

    /// Make `create` fail with a collaborator error for rows carrying `field = value`
    #[cfg(test)]
    pub fn fail_create_when(&self, field: &str, value: &str) {
        self.state.lock().fail_create = Some((field.to_string(), value.to_string()));
    }

    #[cfg(test)]
    pub fn clear_failures(&self) {
        self.state.lock().fail_create = None;
    }

    #[cfg(test)]
    pub fn record(&self, record_id: Uuid) -> Option<MemoryRecord> {
        self.state.lock().records.get(&record_id).cloned()
    }

    /// Live records of a module
    #[cfg(test)]
    pub fn live_count(&self, module: &str) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.module == module && !r.deleted)
            .count()
    }

    /// Every delete issued, in order, with the save mode used
    #[cfg(test)]
    pub fn delete_log(&self) -> Vec<(Uuid, SaveMode)> {
        self.state.lock().delete_log.clone()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(
        &self,
        owner_id: Uuid,
        module: &str,
        fields: &RowFields,
        _mode: SaveMode,
    ) -> Result<Uuid, ImportError> {
        let mut state = self.state.lock();
        if let Some((field, value)) = &state.fail_create {
            if fields.get(field) == Some(value) {
                return Err(ImportError::Collaborator(format!(
                    "record store unavailable while creating {} record",
                    module
                )));
            }
        }

        let id = Uuid::new_v4();
        state.records.insert(
            id,
            MemoryRecord {
                module: module.to_string(),
                owner_id,
                fields: fields.clone(),
                deleted: false,
            },
        );
        Ok(id)
    }

    async fn update(
        &self,
        module: &str,
        record_id: Uuid,
        fields: &RowFields,
        policy: MergePolicy,
        _mode: SaveMode,
    ) -> Result<(), ImportError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(&record_id)
            .filter(|r| r.module == module && !r.deleted)
            .ok_or_else(|| ImportError::Collaborator(format!("{} record {} not found", module, record_id)))?;

        for (field, value) in fields {
            match policy {
                MergePolicy::Skip => {}
                MergePolicy::Overwrite => {
                    record.fields.insert(field.clone(), value.clone());
                }
                MergePolicy::Merge => {
                    let missing = record.fields.get(field).map_or(true, |v| v.trim().is_empty());
                    if missing {
                        record.fields.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, module: &str, record_id: Uuid, mode: SaveMode) -> Result<(), ImportError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(&record_id)
            .filter(|r| r.module == module && !r.deleted)
            .ok_or_else(|| ImportError::Collaborator(format!("{} record {} not found", module, record_id)))?;
        record.deleted = true;
        state.delete_log.push((record_id, mode));
        Ok(())
    }

    async fn exists(&self, module: &str, record_id: Uuid) -> Result<bool, ImportError> {
        Ok(self
            .state
            .lock()
            .records
            .get(&record_id)
            .map_or(false, |r| r.module == module && !r.deleted))
    }

    async fn find(&self, module: &str, criteria: &[(&str, &str)]) -> Result<Option<Uuid>, ImportError> {
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .find(|(_, r)| {
                r.module == module
                    && !r.deleted
                    && criteria
                        .iter()
                        .all(|(field, value)| {
                            r.fields
                                .get(*field)
                                .map_or(false, |v| v.to_lowercase() == value.to_lowercase())
                        })
            })
            .map(|(id, _)| *id))
    }

    async fn has_module_permission(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
    ) -> Result<bool, ImportError> {
        let state = self.state.lock();
        Ok(state.open_access || state.grants.contains(&(user_id, module.to_string(), action)))
    }

    async fn is_permitted(
        &self,
        user_id: Uuid,
        module: &str,
        action: RecordAction,
        record_id: Uuid,
    ) -> Result<bool, ImportError> {
        let state = self.state.lock();
        if state.denied_records.contains(&record_id) {
            return Ok(false);
        }
        let owner = state.records.get(&record_id).map_or(false, |r| r.owner_id == user_id);
        Ok(state.open_access || owner || state.grants.contains(&(user_id, module.to_string(), action)))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
