//! Staged row types
//!
//! A staged row is one raw input record held in a per-(user, module)
//! staging table until the executor converts it into a CRM record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw field -> value mapping of one input record
pub type RowFields = BTreeMap<String, String>;

/// Per-row conversion status.
///
/// Transitions only `None -> {Created, Failed, Skipped}`; a terminal
/// status is never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    None,
    Created,
    Failed,
    Skipped,
}

impl RowStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            RowStatus::None => 0,
            RowStatus::Created => 1,
            RowStatus::Failed => 2,
            RowStatus::Skipped => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(RowStatus::None),
            1 => Some(RowStatus::Created),
            2 => Some(RowStatus::Failed),
            3 => Some(RowStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RowStatus::None)
    }
}

/// One row of a staging table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedRow {
    /// Row id, unique within its staging table
    pub id: i64,
    pub user_id: Uuid,
    pub module: String,
    pub fields: RowFields,
    pub status: RowStatus,
    /// Record produced (or matched) by the conversion
    pub record_id: Option<Uuid>,
}

impl StagedRow {
    /// Field value, treating blank strings as absent
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A CREATED row as seen by the undo engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRow {
    pub row_id: i64,
    pub record_id: Uuid,
    /// Value of the grouping column, when grouping was requested
    pub group_key: Option<String>,
}
