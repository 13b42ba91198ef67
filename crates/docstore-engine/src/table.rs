//! Table storage: one sled tree per table, keyed by encoded primary key

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use docstore_common::error::{Result, StorageError};
use docstore_common::query::{Selection, Selector, TableRef, Transform};
use docstore_common::types::{type_name, WriteResult};

use crate::value::{deep_merge, matches, pluck, sort, values_equal};

/// Before/after image of one document touched by a write
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// All document changes produced by one write call
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub changes: Vec<DocChange>,
}

/// Per-document write applied to a selection
#[derive(Debug, Clone)]
pub enum WriteOp {
    Update(Value),
    Replace(Value),
    Delete,
}

/// An open table
#[derive(Debug)]
pub struct Table {
    name: TableRef,
    primary_key: String,
    tree: sled::Tree,
    /// Serializes read-modify-write cycles and change publication
    write_lock: Mutex<()>,
    notifier: RwLock<Option<broadcast::Sender<Arc<TableWrite>>>>,
    closed: AtomicBool,
}

impl Table {
    pub(crate) fn new(name: TableRef, primary_key: String, tree: sled::Tree, feed_buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(feed_buffer);
        Self {
            name,
            primary_key,
            tree,
            write_lock: Mutex::new(()),
            notifier: RwLock::new(Some(tx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &TableRef {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Mark the table closed and end every change feed on it
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notifier.write().take();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::TableNotFound {
                db: self.name.db.clone(),
                table: self.name.table.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Subscribe to writes on this table
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Arc<TableWrite>>> {
        self.ensure_open()?;
        self.notifier
            .read()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| StorageError::Closed.into())
    }

    fn publish(&self, changes: Vec<DocChange>) {
        if changes.is_empty() {
            return;
        }
        if let Some(tx) = self.notifier.read().as_ref() {
            // No receivers is not an error
            let _ = tx.send(Arc::new(TableWrite { changes }));
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetch a document by primary key
    pub fn get(&self, id: &Value) -> Result<Option<Value>> {
        self.ensure_open()?;
        let key = encode_key(id)?;
        match self.tree.get(key) {
            Ok(Some(bytes)) => Ok(Some(decode(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(e.to_string()).into()),
        }
    }

    /// All documents in key order
    pub fn scan(&self) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let mut docs = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            docs.push(decode(&bytes)?);
        }
        Ok(docs)
    }

    /// Evaluate a selection: selector first, then each transform in order
    pub fn select(&self, selection: &Selection) -> Result<Vec<Value>> {
        let docs = match &selection.selector {
            Selector::Key(id) => self.get(id)?.into_iter().collect(),
            Selector::All => self.scan()?,
            Selector::Filter(filter) => self
                .scan()?
                .into_iter()
                .filter(|doc| matches(doc, filter))
                .collect(),
        };
        Ok(apply_transforms(docs, &selection.transforms))
    }

    /// Count the documents a selection addresses
    pub fn count(&self, selection: &Selection) -> Result<u64> {
        Ok(self.select(selection)?.len() as u64)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert one document or an array of documents.
    ///
    /// Items that cannot be stored are counted as errors; everything written
    /// before a storage failure is still published.
    pub fn insert(&self, data: Value) -> Result<WriteResult> {
        self.ensure_open()?;
        let docs = match data {
            Value::Array(items) => items,
            single => vec![single],
        };

        let _guard = self.write_lock.lock();
        let mut result = WriteResult::default();
        let mut changes = Vec::with_capacity(docs.len());

        let outcome = docs
            .into_iter()
            .try_for_each(|doc| self.insert_one(doc, &mut result, &mut changes));
        self.publish(changes);
        outcome?;

        debug!("Inserted {} documents into {}", result.inserted, self.name);
        Ok(result)
    }

    fn insert_one(&self, doc: Value, result: &mut WriteResult, changes: &mut Vec<DocChange>) -> Result<()> {
        let Value::Object(mut fields) = doc else {
            result.error(format!("Expected type OBJECT but found {}.", type_name(&doc)));
            return Ok(());
        };

        let id = match fields.get(&self.primary_key) {
            Some(id) => id.clone(),
            None => {
                let generated = Uuid::new_v4().to_string();
                fields.insert(self.primary_key.clone(), Value::String(generated.clone()));
                result.generated_keys.push(generated.clone());
                Value::String(generated)
            }
        };

        let key = match encode_key(&id) {
            Ok(key) => key,
            Err(e) => {
                result.error(e.to_string());
                return Ok(());
            }
        };

        let doc = Value::Object(fields);
        if self.tree.contains_key(&key).map_err(|e| StorageError::ReadFailed(e.to_string()))? {
            result.error(format!(
                "Duplicate primary key `{}`:\n{}",
                self.primary_key,
                serde_json::to_string_pretty(&doc).unwrap_or_default()
            ));
            return Ok(());
        }

        self.put(&key, &doc)?;
        result.inserted += 1;
        changes.push(DocChange {
            old: None,
            new: Some(doc),
        });
        Ok(())
    }

    /// Apply an update, replace or delete to every document of a selection
    pub fn modify(&self, selection: &Selection, op: &WriteOp) -> Result<WriteResult> {
        self.ensure_open()?;
        if selection.transforms.iter().any(|t| matches!(t, Transform::Pluck(_))) {
            return Err(StorageError::InvalidQuery(
                "Expected type SELECTION but found SEQUENCE (pluck cannot be written to).".to_string(),
            )
            .into());
        }
        if let WriteOp::Update(patch) = op {
            if !patch.is_object() {
                return Err(StorageError::NotAnObject(type_name(patch).to_string()).into());
            }
        }

        let _guard = self.write_lock.lock();
        let mut result = WriteResult::default();
        let mut changes = Vec::new();

        let outcome = self.modify_locked(selection, op, &mut result, &mut changes);
        self.publish(changes);
        outcome?;
        Ok(result)
    }

    fn modify_locked(
        &self,
        selection: &Selection,
        op: &WriteOp,
        result: &mut WriteResult,
        changes: &mut Vec<DocChange>,
    ) -> Result<()> {
        if let Selector::Key(id) = &selection.selector {
            let key = encode_key(id)?;
            return match self.get(id)? {
                Some(old) => self.apply(&key, old, op, result, changes),
                None => self.apply_missing(&key, id, op, result, changes),
            };
        }

        for old in self.select(selection)? {
            let id = old
                .get(&self.primary_key)
                .cloned()
                .ok_or_else(|| StorageError::CorruptData(format!("document without `{}`", self.primary_key)))?;
            let key = encode_key(&id)?;
            self.apply(&key, old, op, result, changes)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        key: &[u8],
        old: Value,
        op: &WriteOp,
        result: &mut WriteResult,
        changes: &mut Vec<DocChange>,
    ) -> Result<()> {
        let new = match op {
            WriteOp::Delete => None,
            WriteOp::Update(patch) => {
                let mut merged = old.clone();
                deep_merge(&mut merged, patch);
                Some(merged)
            }
            WriteOp::Replace(Value::Null) => None,
            WriteOp::Replace(doc) => Some(doc.clone()),
        };

        let Some(new) = new else {
            self.tree
                .remove(key)
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            result.deleted += 1;
            changes.push(DocChange {
                old: Some(old),
                new: None,
            });
            return Ok(());
        };

        if let Err(message) = self.check_primary_key(&old, &new) {
            result.error(message);
            return Ok(());
        }

        if values_equal(&old, &new) {
            result.unchanged += 1;
            return Ok(());
        }

        self.put(key, &new)?;
        result.replaced += 1;
        changes.push(DocChange {
            old: Some(old),
            new: Some(new),
        });
        Ok(())
    }

    fn apply_missing(
        &self,
        key: &[u8],
        id: &Value,
        op: &WriteOp,
        result: &mut WriteResult,
        changes: &mut Vec<DocChange>,
    ) -> Result<()> {
        match op {
            WriteOp::Replace(doc) if !doc.is_null() => {
                let Value::Object(fields) = doc else {
                    result.error(format!("Expected type OBJECT but found {}.", type_name(doc)));
                    return Ok(());
                };
                match fields.get(&self.primary_key) {
                    Some(new_id) if values_equal(new_id, id) => {
                        self.put(key, doc)?;
                        result.inserted += 1;
                        changes.push(DocChange {
                            old: None,
                            new: Some(doc.clone()),
                        });
                    }
                    Some(new_id) => result.error(format!(
                        "Primary key `{}` cannot be changed (`{}` -> `{}`).",
                        self.primary_key, id, new_id
                    )),
                    None => result.error(format!(
                        "Inserted object must have primary key `{}`:\n{}",
                        self.primary_key,
                        serde_json::to_string_pretty(doc).unwrap_or_default()
                    )),
                }
            }
            _ => result.skipped += 1,
        }
        Ok(())
    }

    fn check_primary_key(&self, old: &Value, new: &Value) -> std::result::Result<(), String> {
        let Value::Object(fields) = new else {
            return Err(format!("Expected type OBJECT but found {}.", type_name(new)));
        };
        let old_id = old.get(&self.primary_key).unwrap_or(&Value::Null);
        match fields.get(&self.primary_key) {
            Some(new_id) if values_equal(old_id, new_id) => Ok(()),
            Some(new_id) => Err(format!(
                "Primary key `{}` cannot be changed (`{}` -> `{}`).",
                self.primary_key, old_id, new_id
            )),
            None => Err(format!(
                "Inserted object must have primary key `{}`:\n{}",
                self.primary_key,
                serde_json::to_string_pretty(new).unwrap_or_default()
            )),
        }
    }

    fn put(&self, key: &[u8], doc: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

/// Apply cursor transforms in sequence
pub fn apply_transforms(mut docs: Vec<Value>, transforms: &[Transform]) -> Vec<Value> {
    for transform in transforms {
        match transform {
            Transform::Limit(n) => docs.truncate(usize::try_from(*n).unwrap_or(usize::MAX)),
            Transform::Skip(n) => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX).min(docs.len());
                docs.drain(..n);
            }
            Transform::Pluck(projection) => {
                docs = docs.iter().map(|doc| pluck(doc, projection)).collect();
            }
            Transform::OrderBy(order) => sort(&mut docs, order),
        }
    }
    docs
}

/// Encode a primary key into its tree key.
///
/// Integral floats encode like integers so `1` and `1.0` address the same row.
pub fn encode_key(id: &Value) -> Result<Vec<u8>> {
    let normalized = match id {
        Value::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => {
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                    #[allow(clippy::cast_possible_truncation)]
                    let n = f as i64;
                    Value::from(n)
                }
                _ => id.clone(),
            }
        }
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Array(_) => id.clone(),
        other => return Err(StorageError::InvalidPrimaryKey(type_name(other).to_string()).into()),
    };
    Ok(serde_json::to_vec(&normalized)?)
}

fn decode(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::CorruptData(e.to_string()).into())
}
