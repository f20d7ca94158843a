//! Record store queries over `crm_records`

use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::RowFields;

pub async fn insert_record(
    pool: &PgPool,
    owner_id: Uuid,
    module: &str,
    fields: &RowFields,
) -> sqlx::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO crm_records (id, module, owner_id, fields)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(module)
    .bind(owner_id)
    .bind(Json(fields))
    .execute(pool)
    .await?;

    Ok(id)
}

/// Incoming values win
pub async fn overwrite_fields(
    pool: &PgPool,
    module: &str,
    record_id: Uuid,
    fields: &RowFields,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE crm_records
        SET fields = fields || $3, updated_at = NOW()
        WHERE id = $1 AND module = $2 AND NOT deleted
        "#,
    )
    .bind(record_id)
    .bind(module)
    .bind(Json(fields))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Existing non-blank values win; blanks and missing keys are filled
pub async fn fill_missing_fields(
    pool: &PgPool,
    module: &str,
    record_id: Uuid,
    fields: &RowFields,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE crm_records
        SET fields = $3 || COALESCE(
                (SELECT jsonb_object_agg(key, value)
                 FROM jsonb_each(fields)
                 WHERE value <> '""'::jsonb),
                '{}'::jsonb),
            updated_at = NOW()
        WHERE id = $1 AND module = $2 AND NOT deleted
        "#,
    )
    .bind(record_id)
    .bind(module)
    .bind(Json(fields))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn mark_deleted(pool: &PgPool, module: &str, record_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE crm_records
        SET deleted = TRUE, updated_at = NOW()
        WHERE id = $1 AND module = $2 AND NOT deleted
        "#,
    )
    .bind(record_id)
    .bind(module)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_relations(pool: &PgPool, record_id: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM crm_record_relations WHERE record_id = $1 OR related_id = $1")
        .bind(record_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn record_exists(pool: &PgPool, module: &str, record_id: Uuid) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM crm_records WHERE id = $1 AND module = $2 AND NOT deleted)",
    )
    .bind(record_id)
    .bind(module)
    .fetch_one(pool)
    .await
}

/// Oldest live record matching every criterion, ignoring case
pub async fn find_by_fields(
    pool: &PgPool,
    module: &str,
    criteria: &[(&str, &str)],
) -> sqlx::Result<Option<Uuid>> {
    let filter: Map<String, Value> = criteria
        .iter()
        .map(|(field, value)| (field.to_string(), Value::from(*value)))
        .collect();

    sqlx::query_scalar(
        r#"
        SELECT r.id FROM crm_records r
        WHERE r.module = $1
          AND NOT r.deleted
          AND NOT EXISTS (
              SELECT 1 FROM jsonb_each_text($2) c
              WHERE LOWER(r.fields->>c.key) IS DISTINCT FROM LOWER(c.value)
          )
        ORDER BY r.created_at
        LIMIT 1
        "#,
    )
    .bind(module)
    .bind(Value::Object(filter))
    .fetch_optional(pool)
    .await
}

pub async fn has_module_permission(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    action: &str,
) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM crm_module_permissions
            WHERE user_id = $1 AND module = $2 AND action IN ($3, '*')
        )
        "#,
    )
    .bind(user_id)
    .bind(module)
    .bind(action)
    .fetch_one(pool)
    .await
}

/// Owners may always act on their records; others need the module grant
pub async fn is_record_permitted(
    pool: &PgPool,
    user_id: Uuid,
    module: &str,
    action: &str,
    record_id: Uuid,
) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM crm_records
            WHERE id = $1 AND module = $3 AND owner_id = $2
        ) OR EXISTS (
            SELECT 1 FROM crm_module_permissions
            WHERE user_id = $2 AND module = $3 AND action IN ($4, '*')
        )
        "#,
    )
    .bind(record_id)
    .bind(user_id)
    .bind(module)
    .bind(action)
    .fetch_one(pool)
    .await
}
