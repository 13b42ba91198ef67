//! Store command requests
//!
//! Every inbound pattern is deserialized into one [`Command`] variant keyed by
//! its `cmd` field and validated before any driver call. Unknown fields
//! (including `topic`) are ignored.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

use docstore_bus::ReplyError;
use docstore_common::query::{OrderBy, Projection};
use docstore_common::types::{type_name, Document};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    CreateDatabase(DatabaseRequest),
    RemoveDatabase(DatabaseRequest),
    CreateTable(TableRequest),
    RemoveTable(TableRequest),
    TruncateTable(TableRequest),
    Changes(ChangesRequest),
    Create(CreateRequest),
    Update(WriteRequest),
    UpdateById(WriteByIdRequest),
    Remove(QueryRequest),
    RemoveById(IdRequest),
    Replace(WriteRequest),
    ReplaceById(WriteByIdRequest),
    FindById(IdRequest),
    Count(QueryRequest),
    Exists(QueryRequest),
    Find(FindRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseRequest {
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangesRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub query: Option<Document>,
    #[serde(default)]
    pub options: Option<FindOptions>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub query: Document,
    pub data: Document,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteByIdRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub id: Value,
    pub data: Document,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub query: Document,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FindRequest {
    pub collection: String,
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    pub query: Document,
    #[serde(default)]
    pub options: FindOptions,
}

/// Cursor shaping options shared by `find` and `changes`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub fields: Option<Projection>,
    #[serde(rename = "orderBy", default)]
    pub order_by: Option<OrderBy>,
    #[serde(default, deserialize_with = "non_negative_integer")]
    pub offset: Option<u64>,
    #[serde(default, deserialize_with = "non_negative_integer")]
    pub limit: Option<u64>,
}

/// Accepts integral floats such as `2.0` alongside plain integers
fn non_negative_integer<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(n) = number.as_u64() {
        return Ok(Some(n));
    }
    match number.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f < 9.0e15 => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n = f as u64;
            Ok(Some(n))
        }
        _ => Err(D::Error::custom(format!(
            "expected a non-negative integer, found {}",
            number
        ))),
    }
}

impl Command {
    /// Deserialize and validate an inbound pattern
    pub fn parse(msg: Value) -> Result<Self, ReplyError> {
        let command: Command =
            serde_json::from_value(msg).map_err(|e| ReplyError::invalid_request(e.to_string()))?;
        command.validate().map_err(ReplyError::invalid_request)?;
        Ok(command)
    }

    /// The `cmd` this command was parsed from
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateDatabase(_) => "createDatabase",
            Command::RemoveDatabase(_) => "removeDatabase",
            Command::CreateTable(_) => "createTable",
            Command::RemoveTable(_) => "removeTable",
            Command::TruncateTable(_) => "truncateTable",
            Command::Changes(_) => "changes",
            Command::Create(_) => "create",
            Command::Update(_) => "update",
            Command::UpdateById(_) => "updateById",
            Command::Remove(_) => "remove",
            Command::RemoveById(_) => "removeById",
            Command::Replace(_) => "replace",
            Command::ReplaceById(_) => "replaceById",
            Command::FindById(_) => "findById",
            Command::Count(_) => "count",
            Command::Exists(_) => "exists",
            Command::Find(_) => "find",
        }
    }

    fn collection(&self) -> Option<&str> {
        match self {
            Command::CreateDatabase(_) | Command::RemoveDatabase(_) => None,
            Command::CreateTable(r) | Command::RemoveTable(r) | Command::TruncateTable(r) => {
                Some(r.collection.as_str())
            }
            Command::Changes(r) => Some(r.collection.as_str()),
            Command::Create(r) => Some(r.collection.as_str()),
            Command::Update(r) | Command::Replace(r) => Some(r.collection.as_str()),
            Command::UpdateById(r) | Command::ReplaceById(r) => Some(r.collection.as_str()),
            Command::Remove(r) | Command::Count(r) | Command::Exists(r) => Some(r.collection.as_str()),
            Command::RemoveById(r) | Command::FindById(r) => Some(r.collection.as_str()),
            Command::Find(r) => Some(r.collection.as_str()),
        }
    }

    fn database_name(&self) -> Option<&str> {
        let name = match self {
            Command::CreateDatabase(r) | Command::RemoveDatabase(r) => &r.database_name,
            Command::CreateTable(r) | Command::RemoveTable(r) | Command::TruncateTable(r) => {
                &r.database_name
            }
            Command::Changes(r) => &r.database_name,
            Command::Create(r) => &r.database_name,
            Command::Update(r) | Command::Replace(r) => &r.database_name,
            Command::UpdateById(r) | Command::ReplaceById(r) => &r.database_name,
            Command::Remove(r) | Command::Count(r) | Command::Exists(r) => &r.database_name,
            Command::RemoveById(r) | Command::FindById(r) => &r.database_name,
            Command::Find(r) => &r.database_name,
        };
        name.as_deref()
    }

    /// Database this command targets, falling back to `default`
    pub fn database<'a>(&'a self, default: &'a str) -> &'a str {
        self.database_name().unwrap_or(default)
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(collection) = self.collection() {
            if collection.is_empty() {
                return Err("\"collection\" is not allowed to be empty".to_string());
            }
        }
        if self.database_name().map_or(false, str::is_empty) {
            return Err("\"databaseName\" is not allowed to be empty".to_string());
        }

        match self {
            Command::Create(r) => validate_data(&r.data),
            Command::UpdateById(r) | Command::ReplaceById(r) => validate_id(&r.id),
            Command::RemoveById(r) | Command::FindById(r) => validate_id(&r.id),
            _ => Ok(()),
        }
    }
}

fn validate_id(id: &Value) -> Result<(), String> {
    match id {
        Value::Null => Err("\"id\" is required".to_string()),
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Array(_) => Ok(()),
        other => Err(format!(
            "\"id\" must be a string, number, boolean or array (got {})",
            type_name(other)
        )),
    }
}

fn validate_data(data: &Value) -> Result<(), String> {
    match data {
        Value::Null => Err("\"data\" is required".to_string()),
        Value::Object(_) => Ok(()),
        Value::Array(items) => match items.iter().find(|item| !item.is_object()) {
            Some(item) => Err(format!(
                "\"data\" items must be objects (got {})",
                type_name(item)
            )),
            None => Ok(()),
        },
        other => Err(format!(
            "\"data\" must be an object or an array (got {})",
            type_name(other)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_bus::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let command = Command::parse(json!({
            "topic": "docstore",
            "cmd": "findById",
            "collection": "users",
            "id": "abc",
            "extra": {"anything": true}
        }))
        .unwrap();

        assert_eq!(command.name(), "findById");
        assert_eq!(command.database("test"), "test");
        let Command::FindById(request) = command else {
            panic!("expected findById");
        };
        assert_eq!(request.id, json!("abc"));
    }

    #[test]
    fn test_database_name_overrides_default() {
        let command = Command::parse(json!({"cmd": "createDatabase", "databaseName": "shop"})).unwrap();
        assert_eq!(command.database("test"), "shop");
    }

    #[test]
    fn test_required_fields() {
        let missing_collection = Command::parse(json!({"cmd": "find", "query": {}})).unwrap_err();
        assert_eq!(missing_collection.code, ErrorCode::InvalidRequest);
        assert!(missing_collection.message.contains("collection"));

        let missing_query = Command::parse(json!({"cmd": "count", "collection": "users"})).unwrap_err();
        assert!(missing_query.message.contains("query"));

        let missing_data = Command::parse(json!({"cmd": "updateById", "collection": "users", "id": 1})).unwrap_err();
        assert!(missing_data.message.contains("data"));

        let missing_id = Command::parse(json!({"cmd": "findById", "collection": "users"})).unwrap_err();
        assert_eq!(missing_id.message, "\"id\" is required");
    }

    #[test]
    fn test_field_types() {
        assert!(Command::parse(json!({"cmd": "find", "collection": "", "query": {}})).is_err());
        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": "x"})).is_err());
        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": {}, "databaseName": ""})).is_err());
        assert!(Command::parse(json!({"cmd": "removeById", "collection": "u", "id": null})).is_err());
        assert!(Command::parse(json!({"cmd": "removeById", "collection": "u", "id": {"a": 1}})).is_err());
        assert!(Command::parse(json!({"cmd": "create", "collection": "u", "data": 5})).is_err());
        assert!(Command::parse(json!({"cmd": "create", "collection": "u", "data": [{}, 1]})).is_err());
        assert!(Command::parse(json!({"cmd": "create", "collection": "u", "data": [{"a": 1}]})).is_ok());
    }

    #[test]
    fn test_find_options() {
        let command = Command::parse(json!({
            "cmd": "find",
            "collection": "users",
            "query": {},
            "options": {"limit": 10, "offset": 2, "fields": ["name"], "orderBy": {"name": "desc"}}
        }))
        .unwrap();
        let Command::Find(request) = command else {
            panic!("expected find");
        };
        assert_eq!(request.options.limit, Some(10));
        assert_eq!(request.options.offset, Some(2));
        assert_eq!(request.options.order_by, Some(OrderBy::desc("name")));
        assert_eq!(request.options.fields, Some(Projection::fields(["name"])));

        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": {}, "options": {"limit": -1}})).is_err());
        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": {}, "options": {"limit": 1.5}})).is_err());
        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": {}, "options": {"limit": "2"}})).is_err());
        assert!(Command::parse(json!({"cmd": "find", "collection": "u", "query": {}, "options": {"orderBy": 5}})).is_err());
    }

    #[test]
    fn test_integral_float_options() {
        let command = Command::parse(json!({
            "cmd": "find",
            "collection": "users",
            "query": {},
            "options": {"limit": 2.0, "offset": 0.0}
        }))
        .unwrap();
        let Command::Find(request) = command else {
            panic!("expected find");
        };
        assert_eq!(request.options.limit, Some(2));
        assert_eq!(request.options.offset, Some(0));
    }

    #[test]
    fn test_changes_query_and_options_optional() {
        let command = Command::parse(json!({"cmd": "changes", "collection": "users"})).unwrap();
        let Command::Changes(request) = command else {
            panic!("expected changes");
        };
        assert!(request.query.is_none());
        assert!(request.options.is_none());
    }
}
