//! Staging table queries
//!
//! Each (user, module) pair gets its own table named
//! `crm_import_<user hex>_<module>`. Identifiers are validated before they
//! are spliced into SQL; values always go through bind parameters.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::ImportError;
use crate::types::{CreatedRow, ImportCounts, RowFields, RowStatus, StagedRow};

/// Postgres truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Postgres caps bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Accept `[A-Za-z_][A-Za-z0-9_]*` only
pub fn validate_identifier(name: &str) -> Result<(), ImportError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(ImportError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// Columns every staging table carries besides the staged fields
const SYSTEM_COLUMNS: [&str; 3] = ["id", "status", "recordid"];

/// Validate a staged field list: identifiers only, no system columns, no
/// duplicates, at least one field
pub fn validate_fields(fields: &[String]) -> Result<(), ImportError> {
    if fields.is_empty() {
        return Err(ImportError::InvalidInput("no fields to stage".into()));
    }
    for (index, field) in fields.iter().enumerate() {
        validate_identifier(field)?;
        if SYSTEM_COLUMNS.contains(&field.to_lowercase().as_str()) {
            return Err(ImportError::InvalidIdentifier(field.clone()));
        }
        if fields[..index].contains(field) {
            return Err(ImportError::InvalidInput(format!("field {} is listed twice", field)));
        }
    }
    Ok(())
}

/// Module names are case-sensitive here exactly as in the job queue lock,
/// so the table name keeps the module's case and is always quoted.
pub fn table_name(user_id: Uuid, module: &str) -> Result<String, ImportError> {
    validate_identifier(module)?;
    let name = format!("crm_import_{}_{}", user_id.simple(), module);
    validate_identifier(&name)?;
    Ok(name)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

fn column_list(fields: &[String]) -> Result<String, ImportError> {
    fields.iter().try_for_each(|f| validate_identifier(f))?;
    Ok(fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", "))
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool, ImportError> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(quote(table))
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Drop and recreate the staging table with one TEXT column per field
pub async fn recreate_table(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    fields: &[String],
) -> Result<(), ImportError> {
    let table = table_name(user_id, module)?;
    validate_fields(fields)?;
    let columns: Vec<String> = fields.iter().map(|f| format!("{} TEXT", quote(f))).collect();

    let mut ddl = format!(
        "CREATE TABLE {} (id BIGSERIAL PRIMARY KEY, status SMALLINT NOT NULL DEFAULT 0, recordid UUID",
        quote(&table)
    );
    for column in &columns {
        ddl.push_str(", ");
        ddl.push_str(column);
    }
    ddl.push(')');

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&table)))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&ddl).execute(&mut *tx).await?;
    tx.commit().await?;

    Ok(())
}

/// Staged field columns in creation order; empty when nothing is staged
pub async fn select_fields(pool: &PgPool, user_id: Uuid, module: &str) -> Result<Vec<String>, ImportError> {
    let table = table_name(user_id, module)?;
    let fields: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT column_name::TEXT FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = $1
          AND column_name::TEXT <> ALL($2::TEXT[])
        ORDER BY ordinal_position
        "#,
    )
    .bind(&table)
    .bind(&SYSTEM_COLUMNS[..])
    .fetch_all(pool)
    .await?;
    Ok(fields)
}

/// Insert rows with status NONE; returns the number inserted
pub async fn insert_rows(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    fields: &[String],
    rows: &[RowFields],
) -> Result<u64, ImportError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let table = table_name(user_id, module)?;
    let columns = column_list(fields)?;

    for row in rows {
        if let Some(unknown) = row.keys().find(|k| !fields.contains(k)) {
            return Err(ImportError::InvalidInput(format!(
                "field {} is not staged for {}",
                unknown, module
            )));
        }
    }

    let chunk_size = (MAX_BIND_PARAMS / fields.len().max(1)).max(1);
    let mut inserted = 0u64;
    let mut tx = pool.begin().await?;

    for chunk in rows.chunks(chunk_size) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote(&table), columns));
        builder.push_values(chunk, |mut b, row| {
            for field in fields {
                b.push_bind(row.get(field).cloned());
            }
        });
        let result = builder.build().execute(&mut *tx).await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

fn staged_row_from(
    row: &PgRow,
    user_id: Uuid,
    module: &str,
    fields: &[String],
) -> Result<StagedRow, ImportError> {
    let status_code: i16 = row.try_get("status")?;
    let status = RowStatus::from_i16(status_code).ok_or_else(|| {
        ImportError::InvalidInput(format!("unknown staged row status {}", status_code))
    })?;

    let mut values = RowFields::new();
    for field in fields {
        let value: Option<String> = row.try_get(field.as_str())?;
        if let Some(value) = value {
            values.insert(field.clone(), value);
        }
    }

    Ok(StagedRow {
        id: row.try_get("id")?,
        user_id,
        module: module.to_string(),
        fields: values,
        status,
        record_id: row.try_get("recordid")?,
    })
}

/// First `limit` rows still in status NONE, in insertion order
pub async fn select_pending(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    fields: &[String],
    limit: usize,
) -> Result<Vec<StagedRow>, ImportError> {
    let table = table_name(user_id, module)?;
    if !table_exists(pool, &table).await? {
        return Ok(vec![]);
    }

    let mut select = String::from("id, status, recordid");
    if !fields.is_empty() {
        select.push_str(", ");
        select.push_str(&column_list(fields)?);
    }

    let rows = sqlx::query(&format!(
        "SELECT {} FROM {} WHERE status = $1 ORDER BY id LIMIT $2",
        select,
        quote(&table)
    ))
    .bind(RowStatus::None.as_i16())
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| staged_row_from(row, user_id, module, fields))
        .collect()
}

pub async fn count_rows(pool: &PgPool, user_id: Uuid, module: &str) -> Result<u64, ImportError> {
    let table = table_name(user_id, module)?;
    if !table_exists(pool, &table).await? {
        return Ok(0);
    }

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote(&table)))
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

pub async fn count_by_status(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
) -> Result<ImportCounts, ImportError> {
    let table = table_name(user_id, module)?;
    if !table_exists(pool, &table).await? {
        return Ok(ImportCounts::default());
    }

    let rows: Vec<(i16, i64)> = sqlx::query_as(&format!(
        "SELECT status, COUNT(*) FROM {} GROUP BY status",
        quote(&table)
    ))
    .fetch_all(pool)
    .await?;

    let mut counts = ImportCounts::default();
    for (status, count) in rows {
        let count = count as u64;
        counts.total += count;
        match RowStatus::from_i16(status) {
            Some(RowStatus::Created) => counts.created += count,
            Some(RowStatus::Failed) => counts.failed += count,
            Some(RowStatus::Skipped) => counts.skipped += count,
            Some(RowStatus::None) | None => {}
        }
    }
    Ok(counts)
}

/// Set a terminal status on a row still in NONE. Returns false when the row
/// is missing or already terminal.
pub async fn update_row_status(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    row_id: i64,
    status: RowStatus,
    record_id: Option<Uuid>,
) -> Result<bool, ImportError> {
    let table = table_name(user_id, module)?;
    let result = sqlx::query(&format!(
        "UPDATE {} SET status = $1, recordid = $2 WHERE id = $3 AND status = $4",
        quote(&table)
    ))
    .bind(status.as_i16())
    .bind(record_id)
    .bind(row_id)
    .bind(RowStatus::None.as_i16())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// CREATED rows with a record id, optionally carrying a grouping column
pub async fn select_created(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    group_field: Option<&str>,
) -> Result<Vec<CreatedRow>, ImportError> {
    let table = table_name(user_id, module)?;
    if !table_exists(pool, &table).await? {
        return Ok(vec![]);
    }

    let group_column = match group_field {
        Some(field) => {
            validate_identifier(field)?;
            quote(field)
        }
        None => "NULL::TEXT".to_string(),
    };

    let rows: Vec<(i64, Uuid, Option<String>)> = sqlx::query_as(&format!(
        "SELECT id, recordid, {} FROM {} WHERE status = $1 AND recordid IS NOT NULL ORDER BY id",
        group_column,
        quote(&table)
    ))
    .bind(RowStatus::Created.as_i16())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(row_id, record_id, group_key)| CreatedRow {
            row_id,
            record_id,
            group_key,
        })
        .collect())
}
