//! Driver query chains
//!
//! A `Query` is one complete driver call: database → table → optional
//! selector → operation, plus any cursor shaping. Queries are pure data built
//! with the fluent helpers in this module and executed by a [`Driver`].
//!
//! ```rust,ignore
//! use docstore_common::query;
//!
//! let q = query::db("test")
//!     .table("users")
//!     .filter(filter)
//!     .limit(10)
//!     .fetch();
//! let docs = driver.run(q).await?;
//! ```
//!
//! [`Driver`]: crate::driver::Driver

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Document;

/// A table inside a database
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub db: String,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.table)
    }
}

/// Which documents of a table a query addresses
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Every document
    All,
    /// Documents matching a filter object
    Filter(Document),
    /// The single document with this primary key
    Key(Value),
}

/// Cursor shaping step, applied in sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Limit(u64),
    Skip(u64),
    Pluck(Projection),
    OrderBy(OrderBy),
}

/// A selector plus its shaping steps
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub table: TableRef,
    pub selector: Selector,
    pub transforms: Vec<Transform>,
}

/// One driver call
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    DbCreate { db: String },
    DbDrop { db: String },
    TableCreate { db: String, table: String, primary_key: String },
    TableDrop(TableRef),
    Insert { table: TableRef, data: Value },
    Update { selection: Selection, patch: Value },
    Replace { selection: Selection, doc: Value },
    Delete { selection: Selection },
    Count { selection: Selection },
    Fetch { selection: Selection },
}

impl Query {
    /// Short operation name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Query::DbCreate { .. } => "db_create",
            Query::DbDrop { .. } => "db_drop",
            Query::TableCreate { .. } => "table_create",
            Query::TableDrop(_) => "table_drop",
            Query::Insert { .. } => "insert",
            Query::Update { .. } => "update",
            Query::Replace { .. } => "replace",
            Query::Delete { .. } => "delete",
            Query::Count { .. } => "count",
            Query::Fetch { .. } => "fetch",
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Start a chain at a database
pub fn db(name: impl Into<String>) -> Db {
    Db { name: name.into() }
}

#[derive(Debug, Clone)]
pub struct Db {
    name: String,
}

impl Db {
    pub fn create(self) -> Query {
        Query::DbCreate { db: self.name }
    }

    pub fn drop(self) -> Query {
        Query::DbDrop { db: self.name }
    }

    pub fn table_create(self, table: impl Into<String>, primary_key: impl Into<String>) -> Query {
        Query::TableCreate {
            db: self.name,
            table: table.into(),
            primary_key: primary_key.into(),
        }
    }

    pub fn table_drop(self, table: impl Into<String>) -> Query {
        Query::TableDrop(TableRef {
            db: self.name,
            table: table.into(),
        })
    }

    pub fn table(self, table: impl Into<String>) -> Table {
        Table {
            table: TableRef {
                db: self.name,
                table: table.into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    table: TableRef,
}

impl Table {
    pub fn insert(self, data: Value) -> Query {
        Query::Insert {
            table: self.table,
            data,
        }
    }

    /// Delete every document, keeping the table
    pub fn delete(self) -> Query {
        self.all().delete()
    }

    pub fn all(self) -> Selection {
        self.select(Selector::All)
    }

    pub fn filter(self, filter: Document) -> Selection {
        self.select(Selector::Filter(filter))
    }

    pub fn get(self, id: Value) -> Selection {
        self.select(Selector::Key(id))
    }

    fn select(self, selector: Selector) -> Selection {
        Selection {
            table: self.table,
            selector,
            transforms: Vec::new(),
        }
    }
}

impl Selection {
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.transforms.push(Transform::Limit(n));
        self
    }

    #[must_use]
    pub fn skip(mut self, n: u64) -> Self {
        self.transforms.push(Transform::Skip(n));
        self
    }

    #[must_use]
    pub fn pluck(mut self, projection: Projection) -> Self {
        self.transforms.push(Transform::Pluck(projection));
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.transforms.push(Transform::OrderBy(order));
        self
    }

    pub fn update(self, patch: Value) -> Query {
        Query::Update {
            selection: self,
            patch,
        }
    }

    pub fn replace(self, doc: Value) -> Query {
        Query::Replace {
            selection: self,
            doc,
        }
    }

    pub fn delete(self) -> Query {
        Query::Delete { selection: self }
    }

    pub fn count(self) -> Query {
        Query::Count { selection: self }
    }

    pub fn fetch(self) -> Query {
        Query::Fetch { selection: self }
    }

    /// True when a limit or skip bounds the selection
    pub fn is_windowed(&self) -> bool {
        self.transforms
            .iter()
            .any(|t| matches!(t, Transform::Limit(_) | Transform::Skip(_)))
    }
}

// ============================================================================
// Projection
// ============================================================================

/// Field projection (`pluck`)
///
/// Accepts a field name, an array of names/objects, or an object whose values
/// are `true` or a nested projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Projection {
    fields: Vec<(String, Option<Projection>)>,
}

impl Projection {
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: names.into_iter().map(|n| (n.into(), None)).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Projection>)> {
        self.fields.iter().map(|(k, p)| (k.as_str(), p.as_ref()))
    }

    fn push(&mut self, name: String, nested: Option<Projection>) {
        self.fields.retain(|(k, _)| *k != name);
        self.fields.push((name, nested));
    }

    fn extend_from(&mut self, value: Value) -> Result<(), String> {
        match value {
            Value::String(name) => self.push(name, None),
            Value::Array(items) => {
                for item in items {
                    self.extend_from(item)?;
                }
            }
            Value::Object(map) => {
                for (name, v) in map {
                    match v {
                        Value::Bool(true) => self.push(name, None),
                        nested @ (Value::String(_) | Value::Array(_) | Value::Object(_)) => {
                            let nested = Projection::try_from(nested)?;
                            self.push(name, Some(nested));
                        }
                        other => return Err(format!("Invalid path argument `{}`.", other)),
                    }
                }
            }
            other => return Err(format!("Invalid path argument `{}`.", other)),
        }
        Ok(())
    }
}

impl TryFrom<Value> for Projection {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let mut projection = Projection { fields: Vec::new() };
        projection.extend_from(value)?;
        Ok(projection)
    }
}

impl From<Projection> for Value {
    fn from(projection: Projection) -> Self {
        let map: Map<String, Value> = projection
            .fields
            .into_iter()
            .map(|(k, nested)| (k, nested.map_or(Value::Bool(true), Value::from)))
            .collect();
        Value::Object(map)
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

/// Sort order (`orderBy`)
///
/// Accepts a field name, an object of `field: direction`, or an array of
/// either. Directions are `1`/`-1`, `"asc"`/`"desc"` or their long forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct OrderBy {
    keys: Vec<SortKey>,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![SortKey {
                field: field.into(),
                direction: Direction::Asc,
            }],
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![SortKey {
                field: field.into(),
                direction: Direction::Desc,
            }],
        }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    fn extend_from(&mut self, value: Value) -> Result<(), String> {
        match value {
            Value::String(field) => self.keys.push(SortKey {
                field,
                direction: Direction::Asc,
            }),
            Value::Array(items) => {
                for item in items {
                    self.extend_from(item)?;
                }
            }
            Value::Object(map) => {
                for (field, dir) in map {
                    let direction = parse_direction(&dir)
                        .ok_or_else(|| format!("Invalid sort direction `{}` for `{}`.", dir, field))?;
                    self.keys.push(SortKey { field, direction });
                }
            }
            other => return Err(format!("Invalid orderBy argument `{}`.", other)),
        }
        Ok(())
    }
}

fn parse_direction(value: &Value) -> Option<Direction> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(Direction::Asc),
            Some(-1) => Some(Direction::Desc),
            _ => None,
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Direction::Asc),
            "desc" | "descending" => Some(Direction::Desc),
            _ => None,
        },
        _ => None,
    }
}

impl TryFrom<Value> for OrderBy {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let mut order = OrderBy { keys: Vec::new() };
        order.extend_from(value)?;
        if order.keys.is_empty() {
            return Err("orderBy requires at least one field.".to_string());
        }
        Ok(order)
    }
}

impl From<OrderBy> for Value {
    fn from(order: OrderBy) -> Self {
        Value::Array(
            order
                .keys
                .into_iter()
                .map(|k| {
                    let dir = match k.direction {
                        Direction::Asc => "asc",
                        Direction::Desc => "desc",
                    };
                    let mut map = Map::new();
                    map.insert(k.field, Value::String(dir.to_string()));
                    Value::Object(map)
                })
                .collect(),
        )
    }
}
