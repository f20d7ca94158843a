//! NATS message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::import_job::MergePolicy;
use super::staging::RowFields;

/// Generic request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub token: Option<String>, // JWT access token
    pub payload: T,
}

impl<T> Request<T> {
    #[cfg(test)]
    pub fn with_token(token: String, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            token: Some(token),
            payload,
        }
    }
}

/// Generic success response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(request_id: Uuid, payload: T) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(request_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

// ==========================================================================
// Import payloads
// ==========================================================================

/// Replace the staging table of a module with new rows.
///
/// Rows come either pre-split in `rows` or as `;`-delimited CSV text with a
/// header line in `csv_content`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRowsRequest {
    pub module: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub rows: Vec<RowFields>,
    #[serde(default)]
    pub csv_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRowsResponse {
    pub module: String,
    pub staged: u64,
}

/// Request carrying only a module name (preview, undo, status)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRequest {
    pub module: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub module: String,
    pub importable_rows_count: u64,
    pub rows: Vec<RowFields>,
}

/// Start importing the staged rows of a module.
///
/// A source that writes to several modules lists all of them in `modules`,
/// in import order, with `module` as the main one. Every listed module is
/// locked and gets its own job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImportRequest {
    pub module: String,
    #[serde(default)]
    pub modules: Vec<String>,
    /// Identifier of the import source that staged the rows
    pub source: String,
    #[serde(default)]
    pub merge_policy: MergePolicy,
}

/// Undo the latest finished import. `modules` lists the modules of a
/// multi-module import in import order; they are undone in reverse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoImportRequest {
    pub module: String,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// Resume a scheduled or halted job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueImportRequest {
    pub job_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_import_request_defaults_merge_policy() {
        let json = r#"{"module":"Contacts","source":"CsvContacts"}"#;
        let request: StartImportRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.merge_policy, MergePolicy::Skip);
    }

    #[test]
    fn test_undo_request_defaults_to_single_module() {
        let request: UndoImportRequest = serde_json::from_str(r#"{"module":"Contacts"}"#).unwrap();
        assert!(request.modules.is_empty());
    }

    #[test]
    fn test_stage_request_accepts_csv_only() {
        let json = r#"{"module":"Contacts","csvContent":"lastname;email\nDoe;doe@example.com"}"#;
        let request: StageRowsRequest = serde_json::from_str(json).unwrap();
        assert!(request.rows.is_empty());
        assert!(request.fields.is_empty());
        assert!(request.csv_content.is_some());
    }

    #[test]
    fn test_error_response_details_are_optional() {
        let plain = ErrorResponse::new(Uuid::nil(), "LOCKED", "busy");
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("details"));

        let detailed = plain.with_details(serde_json::json!({"template": "errorPage"}));
        let json = serde_json::to_string(&detailed).unwrap();
        assert!(json.contains("details"));
    }
}
