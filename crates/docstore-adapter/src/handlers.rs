//! Store command handlers
//!
//! Each command issues exactly one driver call and forwards its result.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use docstore_bus::{ErrorCode, Handler, Reply, ReplyError};
use docstore_common::config::AdapterConfig;
use docstore_common::driver::Driver;
use docstore_common::error::Error;
use docstore_common::query::{self, Query, Selection};
use docstore_common::types::PRIMARY_KEY;

use crate::request::{
    ChangesRequest, Command, CreateRequest, FindOptions, FindRequest, IdRequest, QueryRequest,
    TableRequest, WriteByIdRequest, WriteRequest,
};

type HandlerResult = Result<Value, ReplyError>;

/// Store service state
pub struct StoreService {
    driver: Arc<dyn Driver>,
    config: AdapterConfig,
}

impl StoreService {
    pub fn new(driver: Arc<dyn Driver>, config: AdapterConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Handle a validated command
    pub async fn handle(&self, command: Command) -> Reply {
        let db = command.database(&self.config.default_database).to_string();
        debug!("Handling {} on database {}", command.name(), db);

        let result = match command {
            Command::CreateDatabase(_) => self.run(query::db(db.as_str()).create()).await,
            Command::RemoveDatabase(_) => self.run(query::db(db.as_str()).drop()).await,
            Command::CreateTable(req) => self.create_table(&db, req).await,
            Command::RemoveTable(req) => self.remove_table(&db, req).await,
            Command::TruncateTable(req) => self.truncate_table(&db, req).await,
            Command::Changes(req) => return self.changes(&db, req).await,
            Command::Create(req) => self.create(&db, req).await,
            Command::Update(req) => self.update(&db, req).await,
            Command::UpdateById(req) => self.update_by_id(&db, req).await,
            Command::Remove(req) => self.remove(&db, req).await,
            Command::RemoveById(req) => self.remove_by_id(&db, req).await,
            Command::Replace(req) => self.replace(&db, req).await,
            Command::ReplaceById(req) => self.replace_by_id(&db, req).await,
            Command::FindById(req) => self.find_by_id(&db, req).await,
            Command::Count(req) => self.count(&db, req).await,
            Command::Exists(req) => self.exists(&db, req).await,
            Command::Find(req) => self.find(&db, req).await,
        };
        Reply::Single(result)
    }

    async fn run(&self, query: Query) -> HandlerResult {
        let name = query.name();
        self.driver.run(query).await.map_err(|e| {
            warn!("Driver call {} failed: {}", name, e);
            to_reply_error(&e)
        })
    }

    // ========================================================================
    // Database/Table Lifecycle
    // ========================================================================

    async fn create_table(&self, db: &str, req: TableRequest) -> HandlerResult {
        self.run(query::db(db).table_create(req.collection, PRIMARY_KEY))
            .await
    }

    async fn remove_table(&self, db: &str, req: TableRequest) -> HandlerResult {
        self.run(query::db(db).table_drop(req.collection)).await
    }

    async fn truncate_table(&self, db: &str, req: TableRequest) -> HandlerResult {
        self.run(query::db(db).table(req.collection).delete()).await
    }

    // ========================================================================
    // Store Interface
    // ========================================================================

    async fn create(&self, db: &str, req: CreateRequest) -> HandlerResult {
        self.run(query::db(db).table(req.collection).insert(req.data))
            .await
    }

    async fn update(&self, db: &str, req: WriteRequest) -> HandlerResult {
        let q = query::db(db)
            .table(req.collection)
            .filter(req.query)
            .update(Value::Object(req.data));
        self.run(q).await
    }

    async fn update_by_id(&self, db: &str, req: WriteByIdRequest) -> HandlerResult {
        let q = query::db(db)
            .table(req.collection)
            .get(req.id)
            .update(Value::Object(req.data));
        self.run(q).await
    }

    async fn remove(&self, db: &str, req: QueryRequest) -> HandlerResult {
        let q = query::db(db).table(req.collection).filter(req.query).delete();
        self.run(q).await
    }

    async fn remove_by_id(&self, db: &str, req: IdRequest) -> HandlerResult {
        let q = query::db(db).table(req.collection).get(req.id).delete();
        self.run(q).await
    }

    async fn replace(&self, db: &str, req: WriteRequest) -> HandlerResult {
        let q = query::db(db)
            .table(req.collection)
            .filter(req.query)
            .replace(Value::Object(req.data));
        self.run(q).await
    }

    async fn replace_by_id(&self, db: &str, req: WriteByIdRequest) -> HandlerResult {
        let q = query::db(db)
            .table(req.collection)
            .get(req.id)
            .replace(Value::Object(req.data));
        self.run(q).await
    }

    async fn find_by_id(&self, db: &str, req: IdRequest) -> HandlerResult {
        let q = query::db(db).table(req.collection).get(req.id).fetch();
        self.run(q).await
    }

    async fn count(&self, db: &str, req: QueryRequest) -> HandlerResult {
        let q = query::db(db).table(req.collection).filter(req.query).count();
        self.run(q).await
    }

    async fn exists(&self, db: &str, req: QueryRequest) -> HandlerResult {
        let q = query::db(db).table(req.collection).filter(req.query).count();
        let count = self.run(q).await?;
        Ok(Value::Bool(count.as_u64().unwrap_or(0) > 0))
    }

    async fn find(&self, db: &str, req: FindRequest) -> HandlerResult {
        let selection = query::db(db).table(req.collection).filter(req.query);
        self.run(shape(selection, req.options).fetch()).await
    }

    // ========================================================================
    // Change Subscription
    // ========================================================================

    async fn changes(&self, db: &str, req: ChangesRequest) -> Reply {
        let table = query::db(db).table(req.collection);
        let mut selection = match req.query {
            Some(filter) => table.filter(filter),
            None => table.all(),
        };
        if let Some(mut options) = req.options {
            options.limit.get_or_insert(1);
            selection = shape(selection, options);
        }

        let target = selection.table.to_string();
        match self.driver.changes(selection).await {
            Ok(feed) => {
                debug!("Subscribed to changes on {}", target);
                let events = feed
                    .map(|item| {
                        let event = item.map_err(|e| to_reply_error(&e))?;
                        serde_json::to_value(&event)
                            .map_err(|e| ReplyError::new(ErrorCode::Internal, e.to_string()))
                    })
                    .boxed();
                Reply::Stream {
                    ack: Value::Bool(true),
                    events,
                }
            }
            Err(e) => {
                warn!("Failed to subscribe to changes on {}: {}", target, e);
                Reply::Single(Err(ReplyError::subscription_setup(e.to_string())))
            }
        }
    }
}

/// Apply options in order: limit, offset, fields, orderBy. Zero counts as unset.
fn shape(mut selection: Selection, options: FindOptions) -> Selection {
    if let Some(limit) = options.limit.filter(|n| *n > 0) {
        selection = selection.limit(limit);
    }
    if let Some(offset) = options.offset.filter(|n| *n > 0) {
        selection = selection.skip(offset);
    }
    if let Some(fields) = options.fields {
        selection = selection.pluck(fields);
    }
    if let Some(order) = options.order_by {
        selection = selection.order_by(order);
    }
    selection
}

fn to_reply_error(e: &Error) -> ReplyError {
    if e.is_storage() {
        ReplyError::store(e.to_string())
    } else {
        ReplyError::new(ErrorCode::Internal, e.to_string())
    }
}

#[async_trait]
impl Handler for StoreService {
    async fn call(&self, msg: Value) -> Reply {
        match Command::parse(msg) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                debug!("Rejected request: {}", e.message);
                Reply::Single(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_common::query::{Transform, OrderBy, Projection};

    fn users() -> Selection {
        query::db("test").table("users").all()
    }

    #[test]
    fn test_shape_applies_options_in_order() {
        let options = FindOptions {
            fields: Some(Projection::fields(["name"])),
            order_by: Some(OrderBy::asc("name")),
            offset: Some(5),
            limit: Some(10),
        };
        let selection = shape(users(), options);

        assert!(matches!(selection.transforms[0], Transform::Limit(10)));
        assert!(matches!(selection.transforms[1], Transform::Skip(5)));
        assert!(matches!(selection.transforms[2], Transform::Pluck(_)));
        assert!(matches!(selection.transforms[3], Transform::OrderBy(_)));
    }

    #[test]
    fn test_shape_skips_zero_and_missing() {
        let options = FindOptions {
            limit: Some(0),
            offset: Some(0),
            ..FindOptions::default()
        };
        assert!(shape(users(), options).transforms.is_empty());
        assert!(shape(users(), FindOptions::default()).transforms.is_empty());
    }

    #[test]
    fn test_storage_errors_map_to_store_error() {
        let err = Error::Storage(docstore_common::error::StorageError::Closed);
        assert_eq!(to_reply_error(&err).code, ErrorCode::StoreError);
        assert_eq!(to_reply_error(&err).message, "Connection is closed.");

        let err = Error::Internal("boom".to_string());
        assert_eq!(to_reply_error(&err).code, ErrorCode::Internal);
    }
}
