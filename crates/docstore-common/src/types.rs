//! Common type definitions for docstore

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored document
pub type Document = Map<String, Value>;

/// Primary key field used for every table the adapter creates
pub const PRIMARY_KEY: &str = "id";

// ============================================================================
// Change Feeds
// ============================================================================

/// One change delivered by a change feed.
///
/// `new_val` is `None` for deletions, `old_val` is `None` for insertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub new_val: Option<Value>,
    pub old_val: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(new_val: Value) -> Self {
        Self {
            new_val: Some(new_val),
            old_val: None,
        }
    }

    pub fn update(old_val: Value, new_val: Value) -> Self {
        Self {
            new_val: Some(new_val),
            old_val: Some(old_val),
        }
    }

    pub fn delete(old_val: Value) -> Self {
        Self {
            new_val: None,
            old_val: Some(old_val),
        }
    }
}

// ============================================================================
// Write Results
// ============================================================================

/// Summary returned by every document write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub deleted: u64,
    pub errors: u64,
    pub inserted: u64,
    pub replaced: u64,
    pub skipped: u64,
    pub unchanged: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

impl WriteResult {
    /// Count a per-document error, keeping the first message
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.into());
        }
    }
}

// ============================================================================
// Catalog Results
// ============================================================================

/// Catalog entry describing a database or a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

/// Before/after pair of a catalog change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub new_val: Option<CatalogEntry>,
    pub old_val: Option<CatalogEntry>,
}

/// Result of a database or table create/drop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbs_created: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbs_dropped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_created: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_dropped: Option<u64>,
    pub config_changes: Vec<ConfigChange>,
}

impl ConfigResult {
    pub fn db_created(entry: CatalogEntry) -> Self {
        Self {
            dbs_created: Some(1),
            config_changes: vec![ConfigChange {
                new_val: Some(entry),
                old_val: None,
            }],
            ..Self::default()
        }
    }

    pub fn db_dropped(entry: CatalogEntry, tables_dropped: u64) -> Self {
        Self {
            dbs_dropped: Some(1),
            tables_dropped: Some(tables_dropped),
            config_changes: vec![ConfigChange {
                new_val: None,
                old_val: Some(entry),
            }],
            ..Self::default()
        }
    }

    pub fn table_created(entry: CatalogEntry) -> Self {
        Self {
            tables_created: Some(1),
            config_changes: vec![ConfigChange {
                new_val: Some(entry),
                old_val: None,
            }],
            ..Self::default()
        }
    }

    pub fn table_dropped(entry: CatalogEntry) -> Self {
        Self {
            tables_dropped: Some(1),
            config_changes: vec![ConfigChange {
                new_val: None,
                old_val: Some(entry),
            }],
            ..Self::default()
        }
    }
}

/// Name of the JSON type of a value, as reported in store errors
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOL",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}
