//! Main storage engine implementation

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sled::{Db, Tree};
use tracing::{debug, info, warn};
use uuid::Uuid;

use docstore_common::config::StorageConfig;
use docstore_common::driver::{ChangeFeed, Driver};
use docstore_common::error::{Error, Result, StorageError};
use docstore_common::query::{Query, Selection, TableRef};
use docstore_common::types::{CatalogEntry, ConfigResult};

use crate::feed;
use crate::table::{Table, WriteOp};

const CATALOG_TREE: &str = "__catalog";

/// Embedded document store backing the driver contract.
///
/// Databases and tables are recorded in a catalog tree; each table's
/// documents live in their own sled tree.
pub struct StorageEngine {
    /// Configuration
    config: StorageConfig,
    /// Embedded database
    db: Db,
    /// Database and table catalog
    catalog: Tree,
    /// Open tables
    tables: DashMap<TableRef, Arc<Table>>,
    /// Serializes catalog changes
    catalog_lock: Mutex<()>,
    /// Running state
    running: Arc<RwLock<bool>>,
}

impl StorageEngine {
    /// Open (or create) a storage engine
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_capacity_bytes)
            .temporary(config.temporary)
            .flush_every_ms(config.flush_every_ms);

        if let Some(path) = &config.path {
            info!("Initializing storage engine at {}", path);
            tokio::fs::create_dir_all(path).await?;
            sled_config = sled_config.path(path);
        } else {
            info!("Initializing temporary storage engine");
        }

        let db = sled_config.open().map_err(storage_write)?;
        let catalog = db.open_tree(CATALOG_TREE).map_err(storage_write)?;

        info!("Storage engine initialized successfully");

        Ok(Self {
            config: config.clone(),
            db,
            catalog,
            tables: DashMap::new(),
            catalog_lock: Mutex::new(()),
            running: Arc::new(RwLock::new(true)),
        })
    }

    /// Check if storage engine is ready
    pub fn is_ready(&self) -> bool {
        *self.running.read()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(StorageError::Closed.into())
        }
    }

    // ========================================================================
    // Catalog Operations
    // ========================================================================

    /// Create a database
    pub fn db_create(&self, name: &str) -> Result<ConfigResult> {
        self.ensure_running()?;
        validate_name("Database", name)?;
        let _guard = self.catalog_lock.lock();

        if self.catalog_get(&db_key(name))?.is_some() {
            return Err(StorageError::DatabaseExists(name.to_string()).into());
        }

        let entry = CatalogEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            db: None,
            primary_key: None,
        };
        self.catalog_put(&db_key(name), &entry)?;

        info!("Created database: {}", name);
        Ok(ConfigResult::db_created(entry))
    }

    /// Create a database unless it already exists
    pub fn ensure_database(&self, name: &str) -> Result<bool> {
        match self.db_create(name) {
            Ok(_) => Ok(true),
            Err(Error::Storage(StorageError::DatabaseExists(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop a database and every table in it
    pub fn db_drop(&self, name: &str) -> Result<ConfigResult> {
        self.ensure_running()?;
        validate_name("Database", name)?;
        let _guard = self.catalog_lock.lock();

        let entry = self
            .catalog_get(&db_key(name))?
            .ok_or_else(|| StorageError::DatabaseNotFound(name.to_string()))?;

        let tables = self.catalog_scan(&format!("table:{}.", name))?;
        for table in &tables {
            self.remove_table(name, table)?;
        }
        self.catalog
            .remove(db_key(name))
            .map_err(storage_write)?;

        info!("Dropped database {} with {} tables", name, tables.len());
        Ok(ConfigResult::db_dropped(entry, tables.len() as u64))
    }

    /// Create a table
    pub fn table_create(&self, db: &str, table: &str, primary_key: &str) -> Result<ConfigResult> {
        self.ensure_running()?;
        validate_name("Database", db)?;
        validate_name("Table", table)?;
        let _guard = self.catalog_lock.lock();

        if self.catalog_get(&db_key(db))?.is_none() {
            return Err(StorageError::DatabaseNotFound(db.to_string()).into());
        }
        if self.catalog_get(&table_key(db, table))?.is_some() {
            return Err(StorageError::TableExists {
                db: db.to_string(),
                table: table.to_string(),
            }
            .into());
        }

        let entry = CatalogEntry {
            id: Uuid::new_v4().to_string(),
            name: table.to_string(),
            db: Some(db.to_string()),
            primary_key: Some(primary_key.to_string()),
        };
        self.db.open_tree(data_tree(&entry)).map_err(storage_write)?;
        self.catalog_put(&table_key(db, table), &entry)?;

        info!("Created table: {}.{}", db, table);
        Ok(ConfigResult::table_created(entry))
    }

    /// Drop a table and its documents
    pub fn table_drop(&self, table: &TableRef) -> Result<ConfigResult> {
        self.ensure_running()?;
        let _guard = self.catalog_lock.lock();

        if self.catalog_get(&db_key(&table.db))?.is_none() {
            return Err(StorageError::DatabaseNotFound(table.db.clone()).into());
        }
        let entry = self
            .catalog_get(&table_key(&table.db, &table.table))?
            .ok_or_else(|| not_found(table))?;
        self.remove_table(&table.db, &entry)?;

        info!("Dropped table: {}", table);
        Ok(ConfigResult::table_dropped(entry))
    }

    /// Open a table, failing when it or its database does not exist
    pub fn table(&self, name: &TableRef) -> Result<Arc<Table>> {
        self.ensure_running()?;

        if let Some(table) = self.tables.get(name) {
            return Ok(table.clone());
        }

        // Drops hold the catalog lock while they evict the table, so the entry
        // read here stays valid until the table is cached.
        let _guard = self.catalog_lock.lock();
        if let Some(table) = self.tables.get(name) {
            return Ok(table.clone());
        }

        let Some(entry) = self.catalog_get(&table_key(&name.db, &name.table))? else {
            if self.catalog_get(&db_key(&name.db))?.is_none() {
                return Err(StorageError::DatabaseNotFound(name.db.clone()).into());
            }
            return Err(not_found(name).into());
        };

        let tree = self.db.open_tree(data_tree(&entry)).map_err(storage_write)?;
        let primary_key = entry
            .primary_key
            .unwrap_or_else(|| docstore_common::types::PRIMARY_KEY.to_string());

        debug!("Opened table {}", name);
        let table = Arc::new(Table::new(name.clone(), primary_key, tree, self.config.feed_buffer));
        self.tables.insert(name.clone(), table.clone());
        Ok(table)
    }

    fn remove_table(&self, db: &str, entry: &CatalogEntry) -> Result<()> {
        let name = TableRef {
            db: db.to_string(),
            table: entry.name.clone(),
        };
        if let Some((_, table)) = self.tables.remove(&name) {
            table.close();
        }
        self.catalog
            .remove(table_key(db, &entry.name))
            .map_err(storage_write)?;
        self.db.drop_tree(data_tree(entry)).map_err(storage_write)?;
        Ok(())
    }

    fn catalog_get(&self, key: &str) -> Result<Option<CatalogEntry>> {
        match self.catalog.get(key) {
            Ok(Some(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(e.to_string()).into()),
        }
    }

    fn catalog_put(&self, key: &str, entry: &CatalogEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        self.catalog.insert(key, value).map_err(storage_write)?;
        Ok(())
    }

    fn catalog_scan(&self, prefix: &str) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for result in self.catalog.scan_prefix(prefix) {
            let (_, value) = result.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    // ========================================================================
    // Query Execution
    // ========================================================================

    /// Execute one query chain
    pub fn execute(&self, query: Query) -> Result<Value> {
        debug!("Executing {}", query.name());
        let value = match query {
            Query::DbCreate { db } => serde_json::to_value(self.db_create(&db)?)?,
            Query::DbDrop { db } => serde_json::to_value(self.db_drop(&db)?)?,
            Query::TableCreate {
                db,
                table,
                primary_key,
            } => serde_json::to_value(self.table_create(&db, &table, &primary_key)?)?,
            Query::TableDrop(table) => serde_json::to_value(self.table_drop(&table)?)?,
            Query::Insert { table, data } => serde_json::to_value(self.table(&table)?.insert(data)?)?,
            Query::Update { selection, patch } => self.write(&selection, &WriteOp::Update(patch))?,
            Query::Replace { selection, doc } => self.write(&selection, &WriteOp::Replace(doc))?,
            Query::Delete { selection } => self.write(&selection, &WriteOp::Delete)?,
            Query::Count { selection } => Value::from(self.table(&selection.table)?.count(&selection)?),
            Query::Fetch { selection } => self.fetch(&selection)?,
        };
        Ok(value)
    }

    fn write(&self, selection: &Selection, op: &WriteOp) -> Result<Value> {
        let result = self.table(&selection.table)?.modify(selection, op)?;
        Ok(serde_json::to_value(result)?)
    }

    /// A get selection yields the document or null, anything else an array
    fn fetch(&self, selection: &Selection) -> Result<Value> {
        let table = self.table(&selection.table)?;
        let mut docs = table.select(selection)?;
        if let docstore_common::query::Selector::Key(_) = selection.selector {
            return Ok(if docs.is_empty() {
                Value::Null
            } else {
                docs.swap_remove(0)
            });
        }
        Ok(Value::Array(docs))
    }

    /// Open a change feed on a selection
    pub fn open_feed(&self, selection: Selection) -> Result<ChangeFeed> {
        let table = self.table(&selection.table)?;
        feed::open(table, selection)
    }

    /// Shutdown the storage engine: end feeds and flush to disk
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut running = self.running.write();
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        info!("Shutting down storage engine");

        for entry in self.tables.iter() {
            entry.value().close();
        }
        self.tables.clear();

        if let Err(e) = self.db.flush_async().await {
            warn!("Failed to flush storage engine: {}", e);
            return Err(storage_write(e));
        }

        info!("Storage engine shutdown complete");
        Ok(())
    }
}

#[async_trait]
impl Driver for StorageEngine {
    async fn run(&self, query: Query) -> Result<Value> {
        self.execute(query)
    }

    async fn changes(&self, selection: Selection) -> Result<ChangeFeed> {
        self.open_feed(selection)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }

    fn is_open(&self) -> bool {
        self.is_ready()
    }
}

fn db_key(name: &str) -> String {
    format!("db:{}", name)
}

fn table_key(db: &str, table: &str) -> String {
    format!("table:{}.{}", db, table)
}

fn data_tree(entry: &CatalogEntry) -> String {
    format!("data:{}", entry.id)
}

fn not_found(table: &TableRef) -> StorageError {
    StorageError::TableNotFound {
        db: table.db.clone(),
        table: table.table.clone(),
    }
}

fn storage_write(e: sled::Error) -> Error {
    StorageError::WriteFailed(e.to_string()).into()
}

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            kind,
            name: name.to_string(),
        }
        .into())
    }
}
