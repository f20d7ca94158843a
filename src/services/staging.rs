//! Staging store
//!
//! Raw rows wait here, one table per (user, module), until the executor
//! converts them. A table is only ever dropped and recreated as a whole by
//! `clear`; rows are never deleted individually.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::db::queries::staging::{validate_fields, validate_identifier};
use crate::error::ImportError;
use crate::types::{CreatedRow, ImportCounts, RowFields, RowStatus, StagedRow};

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Drop and recreate the staging area with one column per field
    async fn clear(&self, user_id: Uuid, module: &str, fields: &[String]) -> Result<(), ImportError>;

    /// Append rows in status NONE; returns the number appended
    async fn append(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        rows: &[RowFields],
    ) -> Result<u64, ImportError>;

    /// Up to `limit` rows still in status NONE, oldest first
    async fn preview(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        limit: usize,
    ) -> Result<Vec<StagedRow>, ImportError>;

    /// Fields the staging area was created with, in column order
    async fn staged_fields(&self, user_id: Uuid, module: &str) -> Result<Vec<String>, ImportError>;

    async fn count(&self, user_id: Uuid, module: &str) -> Result<u64, ImportError>;

    async fn status_counts(&self, user_id: Uuid, module: &str) -> Result<ImportCounts, ImportError>;

    /// Next batch for the executor
    async fn pending_rows(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        limit: usize,
    ) -> Result<Vec<StagedRow>, ImportError> {
        self.preview(user_id, module, fields, limit).await
    }

    /// Move a NONE row to a terminal status. Returns false when the row is
    /// missing or already terminal; terminal statuses are never rewritten.
    async fn mark_row(
        &self,
        user_id: Uuid,
        module: &str,
        row_id: i64,
        status: RowStatus,
        record_id: Option<Uuid>,
    ) -> Result<bool, ImportError>;

    /// CREATED rows carrying a record id, with the value of `group_field`
    /// when given
    async fn created_rows(
        &self,
        user_id: Uuid,
        module: &str,
        group_field: Option<&str>,
    ) -> Result<Vec<CreatedRow>, ImportError>;
}

fn require_terminal(status: RowStatus) -> Result<(), ImportError> {
    if !status.is_terminal() {
        return Err(ImportError::InvalidInput("rows can only be marked with a terminal status".into()));
    }
    Ok(())
}

/// Parse `;`-delimited CSV with a header line into staged rows.
///
/// Blank cells are left out of the row; surplus cells are ignored.
pub fn parse_csv_rows(content: &str) -> Result<(Vec<String>, Vec<RowFields>), ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ImportError::InvalidInput(format!("CSV header: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    validate_fields(&headers)?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ImportError::InvalidInput(format!("CSV row {}: {}", line + 1, e)))?;
        let row: RowFields = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(field, value)| (field.clone(), value.to_string()))
            .collect();
        rows.push(row);
    }

    Ok((headers, rows))
}

// =============================================================================
// PgStagingStore
// =============================================================================

pub struct PgStagingStore {
    pool: PgPool,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn clear(&self, user_id: Uuid, module: &str, fields: &[String]) -> Result<(), ImportError> {
        queries::staging::recreate_table(&self.pool, user_id, module, fields).await
    }

    async fn append(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        rows: &[RowFields],
    ) -> Result<u64, ImportError> {
        queries::staging::insert_rows(&self.pool, user_id, module, fields, rows).await
    }

    async fn preview(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        limit: usize,
    ) -> Result<Vec<StagedRow>, ImportError> {
        queries::staging::select_pending(&self.pool, user_id, module, fields, limit).await
    }

    async fn staged_fields(&self, user_id: Uuid, module: &str) -> Result<Vec<String>, ImportError> {
        queries::staging::select_fields(&self.pool, user_id, module).await
    }

    async fn count(&self, user_id: Uuid, module: &str) -> Result<u64, ImportError> {
        queries::staging::count_rows(&self.pool, user_id, module).await
    }

    async fn status_counts(&self, user_id: Uuid, module: &str) -> Result<ImportCounts, ImportError> {
        queries::staging::count_by_status(&self.pool, user_id, module).await
    }

    async fn mark_row(
        &self,
        user_id: Uuid,
        module: &str,
        row_id: i64,
        status: RowStatus,
        record_id: Option<Uuid>,
    ) -> Result<bool, ImportError> {
        require_terminal(status)?;
        queries::staging::update_row_status(&self.pool, user_id, module, row_id, status, record_id).await
    }

    async fn created_rows(
        &self,
        user_id: Uuid,
        module: &str,
        group_field: Option<&str>,
    ) -> Result<Vec<CreatedRow>, ImportError> {
        queries::staging::select_created(&self.pool, user_id, module, group_field).await
    }
}

// =============================================================================
// MemoryStagingStore
// =============================================================================

struct MemoryTable {
    fields: Vec<String>,
    rows: Vec<StagedRow>,
    next_id: i64,
}

/// In-memory staging for dev runs without a database and for tests
#[derive(Default)]
pub struct MemoryStagingStore {
    tables: Mutex<HashMap<(Uuid, String), MemoryTable>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row of a table, whatever its status
    #[cfg(test)]
    pub fn rows(&self, user_id: Uuid, module: &str) -> Vec<StagedRow> {
        self.tables
            .lock()
            .get(&(user_id, module.to_string()))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn clear(&self, user_id: Uuid, module: &str, fields: &[String]) -> Result<(), ImportError> {
        validate_identifier(module)?;
        validate_fields(fields)?;
        self.tables.lock().insert(
            (user_id, module.to_string()),
            MemoryTable {
                fields: fields.to_vec(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        Ok(())
    }

    async fn append(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        rows: &[RowFields],
    ) -> Result<u64, ImportError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&(user_id, module.to_string()))
            .ok_or_else(|| ImportError::InvalidInput(format!("no staging area for {}", module)))?;

        for row in rows {
            if let Some(unknown) = row.keys().find(|k| !fields.contains(k) || !table.fields.contains(k)) {
                return Err(ImportError::InvalidInput(format!(
                    "field {} is not staged for {}",
                    unknown, module
                )));
            }
        }

        for row in rows {
            let id = table.next_id;
            table.next_id += 1;
            table.rows.push(StagedRow {
                id,
                user_id,
                module: module.to_string(),
                fields: row.clone(),
                status: RowStatus::None,
                record_id: None,
            });
        }
        Ok(rows.len() as u64)
    }

    async fn preview(
        &self,
        user_id: Uuid,
        module: &str,
        fields: &[String],
        limit: usize,
    ) -> Result<Vec<StagedRow>, ImportError> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&(user_id, module.to_string())) else {
            return Ok(vec![]);
        };

        Ok(table
            .rows
            .iter()
            .filter(|row| row.status == RowStatus::None)
            .take(limit)
            .map(|row| {
                let mut row = row.clone();
                row.fields.retain(|field, _| fields.contains(field));
                row
            })
            .collect())
    }

    async fn staged_fields(&self, user_id: Uuid, module: &str) -> Result<Vec<String>, ImportError> {
        Ok(self
            .tables
            .lock()
            .get(&(user_id, module.to_string()))
            .map(|t| t.fields.clone())
            .unwrap_or_default())
    }

    async fn count(&self, user_id: Uuid, module: &str) -> Result<u64, ImportError> {
        Ok(self
            .tables
            .lock()
            .get(&(user_id, module.to_string()))
            .map_or(0, |t| t.rows.len() as u64))
    }

    async fn status_counts(&self, user_id: Uuid, module: &str) -> Result<ImportCounts, ImportError> {
        let tables = self.tables.lock();
        let mut counts = ImportCounts::default();
        if let Some(table) = tables.get(&(user_id, module.to_string())) {
            for row in &table.rows {
                counts.total += 1;
                match row.status {
                    RowStatus::Created => counts.created += 1,
                    RowStatus::Failed => counts.failed += 1,
                    RowStatus::Skipped => counts.skipped += 1,
                    RowStatus::None => {}
                }
            }
        }
        Ok(counts)
    }

    async fn mark_row(
        &self,
        user_id: Uuid,
        module: &str,
        row_id: i64,
        status: RowStatus,
        record_id: Option<Uuid>,
    ) -> Result<bool, ImportError> {
        require_terminal(status)?;
        let mut tables = self.tables.lock();
        let row = tables
            .get_mut(&(user_id, module.to_string()))
            .and_then(|t| t.rows.iter_mut().find(|r| r.id == row_id));

        match row {
            Some(row) if row.status == RowStatus::None => {
                row.status = status;
                row.record_id = record_id;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn created_rows(
        &self,
        user_id: Uuid,
        module: &str,
        group_field: Option<&str>,
    ) -> Result<Vec<CreatedRow>, ImportError> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&(user_id, module.to_string())) else {
            return Ok(vec![]);
        };

        Ok(table
            .rows
            .iter()
            .filter(|row| row.status == RowStatus::Created)
            .filter_map(|row| {
                row.record_id.map(|record_id| CreatedRow {
                    row_id: row.id,
                    record_id,
                    group_key: group_field.and_then(|f| row.fields.get(f).cloned()),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(pairs: &[(&str, &str)]) -> RowFields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn staged(store: &MemoryStagingStore, user: Uuid, n: usize) {
        let cols = fields(&["lastname", "subject"]);
        store.clear(user, "Contacts", &cols).await.unwrap();
        let rows: Vec<RowFields> = (0..n).map(|i| row(&[("lastname", &format!("L{}", i))])).collect();
        store.append(user, "Contacts", &cols, &rows).await.unwrap();
    }

    #[tokio::test]
    async fn test_preview_returns_only_pending_rows_up_to_limit() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        staged(&store, user, 20).await;

        store.mark_row(user, "Contacts", 1, RowStatus::Created, Some(Uuid::new_v4())).await.unwrap();

        let preview = store.preview(user, "Contacts", &fields(&["lastname"]), 12).await.unwrap();
        assert_eq!(preview.len(), 12);
        assert_eq!(preview[0].id, 2);
        assert!(preview.iter().all(|r| r.status == RowStatus::None));
        assert_eq!(store.count(user, "Contacts").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_staging_is_isolated_per_user_and_module() {
        let store = MemoryStagingStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        staged(&store, alice, 3).await;
        staged(&store, bob, 5).await;

        assert_eq!(store.count(alice, "Contacts").await.unwrap(), 3);
        assert_eq!(store.count(bob, "Contacts").await.unwrap(), 5);
        assert_eq!(store.count(alice, "Accounts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_drops_existing_rows() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        staged(&store, user, 4).await;

        store.clear(user, "Contacts", &fields(&["lastname"])).await.unwrap();
        assert_eq!(store.count(user, "Contacts").await.unwrap(), 0);
        assert_eq!(store.staged_fields(user, "Contacts").await.unwrap(), fields(&["lastname"]));
    }

    #[tokio::test]
    async fn test_terminal_status_is_never_rewritten() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        staged(&store, user, 2).await;

        assert!(store.mark_row(user, "Contacts", 1, RowStatus::Failed, None).await.unwrap());
        assert!(!store.mark_row(user, "Contacts", 1, RowStatus::Created, Some(Uuid::new_v4())).await.unwrap());
        assert!(!store.mark_row(user, "Contacts", 99, RowStatus::Created, None).await.unwrap());

        let rows = store.rows(user, "Contacts");
        assert_eq!(rows[0].status, RowStatus::Failed);
        assert_eq!(rows[0].record_id, None);
    }

    #[tokio::test]
    async fn test_mark_row_rejects_none() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        staged(&store, user, 1).await;

        let err = store.mark_row(user, "Contacts", 1, RowStatus::None, None).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        staged(&store, user, 5).await;
        store.mark_row(user, "Contacts", 1, RowStatus::Created, Some(Uuid::new_v4())).await.unwrap();
        store.mark_row(user, "Contacts", 2, RowStatus::Failed, None).await.unwrap();
        store.mark_row(user, "Contacts", 3, RowStatus::Skipped, Some(Uuid::new_v4())).await.unwrap();

        let counts = store.status_counts(user, "Contacts").await.unwrap();
        assert_eq!(counts, ImportCounts { total: 5, created: 1, failed: 1, skipped: 1 });
        assert_eq!(counts.pending(), 2);
    }

    #[tokio::test]
    async fn test_created_rows_carry_group_key() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        let cols = fields(&["subject", "product"]);
        store.clear(user, "Invoice", &cols).await.unwrap();
        store
            .append(
                user,
                "Invoice",
                &cols,
                &[row(&[("subject", "INV-1"), ("product", "A")]), row(&[("subject", "INV-1"), ("product", "B")])],
            )
            .await
            .unwrap();
        let record = Uuid::new_v4();
        store.mark_row(user, "Invoice", 1, RowStatus::Created, Some(record)).await.unwrap();
        store.mark_row(user, "Invoice", 2, RowStatus::Created, Some(record)).await.unwrap();

        let grouped = store.created_rows(user, "Invoice", Some("subject")).await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert!(grouped.iter().all(|r| r.group_key.as_deref() == Some("INV-1")));

        let plain = store.created_rows(user, "Invoice", None).await.unwrap();
        assert!(plain.iter().all(|r| r.group_key.is_none()));
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_fields() {
        let store = MemoryStagingStore::new();
        let user = Uuid::new_v4();
        let cols = fields(&["lastname"]);
        store.clear(user, "Contacts", &cols).await.unwrap();

        let err = store
            .append(user, "Contacts", &cols, &[row(&[("nickname", "x")])])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidInput(_)));
    }

    #[test]
    fn test_parse_csv_rows_semicolon_delimited() {
        let content = "lastname;firstname;email\nDoe;John;john@example.com\nRoe; ;\n";
        let (headers, rows) = parse_csv_rows(content).unwrap();

        assert_eq!(headers, fields(&["lastname", "firstname", "email"]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["email"], "john@example.com");
        assert_eq!(rows[1].len(), 1);
        assert_eq!(rows[1]["lastname"], "Roe");
    }

    #[test]
    fn test_parse_csv_rejects_bad_header() {
        let content = "last name;email\nDoe;x\n";
        assert!(matches!(parse_csv_rows(content), Err(ImportError::InvalidIdentifier(_))));
    }
}
