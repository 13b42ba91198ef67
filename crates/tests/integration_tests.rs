//! Integration tests for docstore
//!
//! These tests run the store adapter behind a real bus server and talk to it
//! over TCP with the bus client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;

use docstore_adapter::StorePlugin;
use docstore_bus::{BusClient, BusServer, ErrorCode, Router};
use docstore_common::config::{AdapterConfig, ServerConfig, StorageConfig};
use docstore_engine::StorageEngine;

const TOPIC: &str = "docstore-store";
const COLLECTION: &str = "users";

/// A running adapter with a connected client
struct TestEnv {
    client: BusClient,
    server: BusServer,
    router: Arc<Router>,
    storage: Arc<StorageEngine>,
    addr: SocketAddr,
    _temp_dir: TempDir,
}

impl TestEnv {
    async fn start() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let storage_config = StorageConfig {
            path: Some(temp_dir.path().join("data").to_string_lossy().to_string()),
            ..StorageConfig::default()
        };
        let storage = Arc::new(
            StorageEngine::new(&storage_config)
                .await
                .expect("Failed to create storage engine"),
        );
        storage.ensure_database("test").expect("Failed to create test database");

        let router = Arc::new(Router::new());
        let adapter_config = AdapterConfig {
            topic: TOPIC.to_string(),
            ..AdapterConfig::default()
        };
        StorePlugin::new(storage.clone(), adapter_config)
            .register(&router)
            .expect("Failed to register store patterns");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local address");
        let server = BusServer::new(&ServerConfig::default(), router.clone());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let client = BusClient::connect(addr)
            .await
            .expect("Failed to connect")
            .with_timeout(Duration::from_secs(5));

        let env = Self {
            client,
            server,
            router,
            storage,
            addr,
            _temp_dir: temp_dir,
        };
        env.act(json!({"cmd": "createTable"}))
            .await
            .expect("Failed to create table");
        env
    }

    /// Send a store pattern with the test topic and collection filled in
    async fn act(&self, mut pattern: Value) -> Result<Value, docstore_bus::ReplyError> {
        pattern["topic"] = json!(TOPIC);
        if pattern.get("collection").is_none() {
            pattern["collection"] = json!(COLLECTION);
        }
        self.client.act(pattern).await
    }

    async fn create(&self, data: Value) -> Value {
        let resp = self
            .act(json!({"cmd": "create", "data": data}))
            .await
            .expect("create failed");
        assert!(resp.is_object());
        resp
    }

    async fn create_peter(&self) -> Value {
        let resp = self.create(json!({"name": "peter"})).await;
        resp["generated_keys"][0].clone()
    }
}

// ============================================================================
// Store Interface
// ============================================================================

#[tokio::test]
async fn test_create() {
    let env = TestEnv::start().await;

    let resp = env.create(json!({"name": "peter"})).await;
    assert_eq!(resp["inserted"], 1);
    assert_eq!(resp["generated_keys"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_many_generates_keys_for_missing_ids() {
    let env = TestEnv::start().await;

    let resp = env
        .create(json!([{"name": "a"}, {"id": "fixed", "name": "b"}, {"name": "c"}]))
        .await;
    assert_eq!(resp["inserted"], 3);
    assert_eq!(resp["generated_keys"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_find() {
    let env = TestEnv::start().await;
    env.create_peter().await;
    env.create_peter().await;

    let resp = env.act(json!({"cmd": "find", "query": {}})).await.unwrap();
    assert_eq!(resp.as_array().unwrap().len(), 2);

    let limited = env
        .act(json!({"cmd": "find", "query": {"name": "peter"}, "options": {"limit": 1}}))
        .await
        .unwrap();
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_find_by_id() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env.act(json!({"cmd": "findById", "id": id.clone()})).await.unwrap();
    assert_eq!(resp["name"], "peter");
    assert_eq!(resp["id"], id);

    let missing = env.act(json!({"cmd": "findById", "id": "missing"})).await.unwrap();
    assert_eq!(missing, Value::Null);
}

#[tokio::test]
async fn test_update() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env
        .act(json!({"cmd": "update", "data": {"name": "peter2"}, "query": {"id": id.clone()}}))
        .await
        .unwrap();
    assert_eq!(resp["replaced"], 1);

    let doc = env.act(json!({"cmd": "findById", "id": id.clone()})).await.unwrap();
    assert_eq!(doc, json!({"id": id, "name": "peter2"}));

    let none = env
        .act(json!({"cmd": "update", "data": {"name": "x"}, "query": {"name": "nobody"}}))
        .await
        .unwrap();
    assert_eq!(none["replaced"], 0);
}

#[tokio::test]
async fn test_update_by_id() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env
        .act(json!({"cmd": "updateById", "data": {"name": "peter2"}, "id": id.clone()}))
        .await
        .unwrap();
    assert_eq!(resp["replaced"], 1);

    let doc = env.act(json!({"cmd": "findById", "id": id})).await.unwrap();
    assert_eq!(doc["name"], "peter2");
}

#[tokio::test]
async fn test_remove() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env.act(json!({"cmd": "remove", "query": {"id": id.clone()}})).await.unwrap();
    assert_eq!(resp["deleted"], 1);

    let doc = env.act(json!({"cmd": "findById", "id": id})).await.unwrap();
    assert_eq!(doc, Value::Null);
}

#[tokio::test]
async fn test_remove_by_id() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env.act(json!({"cmd": "removeById", "id": id.clone()})).await.unwrap();
    assert_eq!(resp["deleted"], 1);

    let again = env.act(json!({"cmd": "removeById", "id": id})).await.unwrap();
    assert_eq!(again["deleted"], 0);
    assert_eq!(again["skipped"], 1);
}

#[tokio::test]
async fn test_replace() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env
        .act(json!({
            "cmd": "replace",
            "data": {"id": id.clone(), "name": "peter2"},
            "query": {"id": id}
        }))
        .await
        .unwrap();
    assert_eq!(resp["replaced"], 1);
}

#[tokio::test]
async fn test_replace_by_id() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env
        .act(json!({
            "cmd": "replaceById",
            "data": {"id": id.clone(), "name": "peter2"},
            "id": id.clone()
        }))
        .await
        .unwrap();
    assert_eq!(resp["replaced"], 1);

    let doc = env.act(json!({"cmd": "findById", "id": id.clone()})).await.unwrap();
    assert_eq!(doc, json!({"id": id, "name": "peter2"}));
}

#[tokio::test]
async fn test_count() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env.act(json!({"cmd": "count", "query": {"id": id}})).await.unwrap();
    assert!(resp.is_number());
    assert_eq!(resp, json!(1));
}

#[tokio::test]
async fn test_exists() {
    let env = TestEnv::start().await;
    let id = env.create_peter().await;

    let resp = env.act(json!({"cmd": "exists", "query": {"id": id}})).await.unwrap();
    assert_eq!(resp, json!(true));

    let resp = env
        .act(json!({"cmd": "exists", "query": {"name": "nobody"}}))
        .await
        .unwrap();
    assert_eq!(resp, json!(false));
}

#[tokio::test]
async fn test_exists_agrees_with_count() {
    let env = TestEnv::start().await;
    env.create(json!([{"name": "peter", "age": 30}, {"name": "paul", "age": 30}])).await;

    for query in [
        json!({}),
        json!({"age": 30}),
        json!({"name": "paul"}),
        json!({"name": "nobody"}),
        json!({"age": 31}),
    ] {
        let count = env
            .act(json!({"cmd": "count", "query": query.clone()}))
            .await
            .unwrap();
        let exists = env
            .act(json!({"cmd": "exists", "query": query.clone()}))
            .await
            .unwrap();
        assert_eq!(exists, json!(count.as_u64().unwrap() > 0), "query {}", query);
    }
}

#[tokio::test]
async fn test_find_applies_limit_before_offset() {
    let env = TestEnv::start().await;
    env.create(json!([
        {"id": 1, "name": "a"},
        {"id": 2, "name": "b"},
        {"id": 3, "name": "c"},
        {"id": 4, "name": "d"}
    ]))
    .await;

    let resp = env
        .act(json!({
            "cmd": "find",
            "query": {},
            "options": {"limit": 3, "offset": 1, "fields": ["name"], "orderBy": {"name": "asc"}}
        }))
        .await
        .unwrap();
    assert_eq!(resp, json!([{"name": "b"}, {"name": "c"}]));

    let resp = env
        .act(json!({"cmd": "find", "query": {}, "options": {"offset": 3}}))
        .await
        .unwrap();
    assert_eq!(resp, json!([{"id": 4, "name": "d"}]));
}

// ============================================================================
// Lifecycle Commands
// ============================================================================

#[tokio::test]
async fn test_truncate_table() {
    let env = TestEnv::start().await;
    env.create(json!([{"name": "a"}, {"name": "b"}])).await;

    let resp = env.act(json!({"cmd": "truncateTable"})).await.unwrap();
    assert_eq!(resp["deleted"], 2);

    let count = env.act(json!({"cmd": "count", "query": {}})).await.unwrap();
    assert_eq!(count, json!(0));
}

#[tokio::test]
async fn test_database_and_table_lifecycle() {
    let env = TestEnv::start().await;

    let created = env
        .act(json!({"cmd": "createDatabase", "databaseName": "shop"}))
        .await
        .unwrap();
    assert_eq!(created["dbs_created"], 1);

    let table = env
        .act(json!({"cmd": "createTable", "databaseName": "shop", "collection": "orders"}))
        .await
        .unwrap();
    assert_eq!(table["tables_created"], 1);
    assert_eq!(table["config_changes"][0]["new_val"]["primary_key"], "id");

    let again = env
        .act(json!({"cmd": "createTable", "databaseName": "shop", "collection": "orders"}))
        .await
        .unwrap_err();
    assert_eq!(again.code, ErrorCode::StoreError);
    assert_eq!(again.message, "Table `shop.orders` already exists.");

    let dropped = env
        .act(json!({"cmd": "removeTable", "databaseName": "shop", "collection": "orders"}))
        .await
        .unwrap();
    assert_eq!(dropped["tables_dropped"], 1);

    let removed = env
        .act(json!({"cmd": "removeDatabase", "databaseName": "shop"}))
        .await
        .unwrap();
    assert_eq!(removed["dbs_dropped"], 1);
}

// ============================================================================
// Change Subscription
// ============================================================================

#[tokio::test]
async fn test_changes() {
    let env = TestEnv::start().await;

    let mut changes = env
        .client
        .subscribe(json!({
            "topic": TOPIC,
            "cmd": "changes",
            "collection": COLLECTION,
            "query": {"name": "changes"}
        }))
        .await
        .unwrap();

    let ack = timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("no acknowledgment")
        .unwrap()
        .unwrap();
    assert_eq!(ack, json!(true));

    // Not matching the subscription's query
    env.create(json!({"name": "other"})).await;
    env.create(json!({"name": "changes"})).await;

    let event = timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("no change event")
        .unwrap()
        .unwrap();
    assert_eq!(event["new_val"]["name"], "changes");
    assert_eq!(event["old_val"], Value::Null);
}

#[tokio::test]
async fn test_changes_setup_error() {
    let env = TestEnv::start().await;

    let mut changes = env
        .client
        .subscribe(json!({"topic": TOPIC, "cmd": "changes", "collection": "ghost"}))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("no reply")
        .unwrap();
    let err = first.unwrap_err();
    assert_eq!(err.code, ErrorCode::SubscriptionSetupError);
    assert!(changes.next().await.is_none());
}

#[tokio::test]
async fn test_changes_end_when_table_removed() {
    let env = TestEnv::start().await;

    let mut changes = env
        .client
        .subscribe(json!({"topic": TOPIC, "cmd": "changes", "collection": COLLECTION}))
        .await
        .unwrap();
    assert_eq!(changes.next().await.unwrap().unwrap(), json!(true));

    env.act(json!({"cmd": "removeTable"})).await.unwrap();

    let end = timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("subscription did not end");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_changes_with_second_client() {
    let env = TestEnv::start().await;
    let writer = BusClient::connect(env.addr).await.unwrap();

    let mut changes = env
        .client
        .subscribe(json!({
            "topic": TOPIC,
            "cmd": "changes",
            "collection": COLLECTION,
            "options": {"fields": ["name"]}
        }))
        .await
        .unwrap();
    assert_eq!(changes.next().await.unwrap().unwrap(), json!(true));

    // options without a limit default to a one-document window
    writer
        .act(json!({"topic": TOPIC, "cmd": "create", "collection": COLLECTION, "data": {"id": 1, "name": "first", "x": 1}}))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("no change event")
        .unwrap()
        .unwrap();
    assert_eq!(event, json!({"new_val": {"name": "first"}, "old_val": null}));
}

// ============================================================================
// Errors and Lifecycle
// ============================================================================

#[tokio::test]
async fn test_validation_error() {
    let env = TestEnv::start().await;

    let err = env.act(json!({"cmd": "find"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    assert_eq!(err.name, "ValidationError");

    let err = env.act(json!({"cmd": "findById", "id": {"nested": true}})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn test_pattern_not_found() {
    let env = TestEnv::start().await;

    let err = env.act(json!({"cmd": "upsert"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PatternNotFound);

    let err = env
        .client
        .act(json!({"topic": "other", "cmd": "find", "collection": COLLECTION, "query": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PatternNotFound);
}

#[tokio::test]
async fn test_missing_table_is_store_error() {
    let env = TestEnv::start().await;

    let err = env
        .act(json!({"cmd": "find", "collection": "ghost", "query": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StoreError);
    assert_eq!(err.message, "Table `test.ghost` does not exist.");
}

#[tokio::test]
async fn test_close_releases_store() {
    let env = TestEnv::start().await;

    env.server.shutdown().await.unwrap();
    env.router.close().await;

    assert!(!env.storage.is_ready());
}
