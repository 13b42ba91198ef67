//! Pattern registration and dispatch
//!
//! Handlers are keyed by `(topic, cmd)`. A request is any JSON object carrying
//! string `topic` and `cmd` fields; the whole object is passed to the handler.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use docstore_common::error::{Error, Result};
use docstore_common::metrics::{self, CommandTimer};

/// Error codes carried by error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    StoreError,
    SubscriptionSetupError,
    PatternNotFound,
    Timeout,
    ConnectionClosed,
    Internal,
}

impl ErrorCode {
    /// Error name reported next to the code
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "ValidationError",
            ErrorCode::StoreError => "StoreError",
            ErrorCode::SubscriptionSetupError => "SubscriptionSetupError",
            ErrorCode::PatternNotFound => "PatternNotFound",
            ErrorCode::Timeout => "TimeoutError",
            ErrorCode::ConnectionClosed => "ConnectionClosed",
            ErrorCode::Internal => "InternalError",
        }
    }
}

/// Error value of a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ReplyError {
    pub name: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ReplyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            name: code.name().to_string(),
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StoreError, message)
    }

    pub fn subscription_setup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SubscriptionSetupError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(ErrorCode::ConnectionClosed, "Connection closed")
    }
}

/// Follow-up replies of a streaming handler
pub type ReplyStream = BoxStream<'static, std::result::Result<Value, ReplyError>>;

/// What a handler answers with
pub enum Reply {
    /// Exactly one result or error
    Single(std::result::Result<Value, ReplyError>),
    /// An acknowledgment followed by zero or more replies
    Stream { ack: Value, events: ReplyStream },
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Single(result) => f.debug_tuple("Single").field(result).finish(),
            Reply::Stream { ack, .. } => f.debug_struct("Stream").field("ack", ack).finish_non_exhaustive(),
        }
    }
}

impl From<std::result::Result<Value, ReplyError>> for Reply {
    fn from(result: std::result::Result<Value, ReplyError>) -> Self {
        Reply::Single(result)
    }
}

/// Pattern handler
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, msg: Value) -> Reply;
}

type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Registered patterns and close hooks
#[derive(Default)]
pub struct Router {
    routes: DashMap<(String, String), Arc<dyn Handler>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    closed: AtomicBool,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `(topic, cmd)`
    pub fn add(&self, topic: &str, cmd: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let key = (topic.to_string(), cmd.to_string());
        if self.routes.contains_key(&key) {
            return Err(Error::Config(format!(
                "Pattern topic:{},cmd:{} is already registered",
                topic, cmd
            )));
        }
        debug!("Registered pattern topic:{},cmd:{}", topic, cmd);
        self.routes.insert(key, handler);
        Ok(())
    }

    /// All registered patterns, sorted
    pub fn patterns(&self) -> Vec<(String, String)> {
        let mut patterns: Vec<_> = self.routes.iter().map(|entry| entry.key().clone()).collect();
        patterns.sort();
        patterns
    }

    /// Run `hook` once when the router closes
    pub fn on_close<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.close_hooks.lock().push(Box::new(move || hook().boxed()));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Route a request to its handler
    pub async fn dispatch(&self, msg: Value) -> Reply {
        if self.is_closed() {
            return Reply::Single(Err(ReplyError::connection_closed()));
        }

        let topic = msg.get("topic").and_then(Value::as_str).unwrap_or_default();
        let cmd = msg.get("cmd").and_then(Value::as_str).unwrap_or_default();

        let handler = self
            .routes
            .get(&(topic.to_string(), cmd.to_string()))
            .map(|entry| entry.value().clone());
        let Some(handler) = handler else {
            metrics::record_unmatched();
            warn!("No handler for pattern topic:{},cmd:{}", topic, cmd);
            return Reply::Single(Err(ReplyError::new(
                ErrorCode::PatternNotFound,
                format!("No handler found for pattern topic:{},cmd:{}", topic, cmd),
            )));
        };

        let cmd = cmd.to_string();
        let _timer = CommandTimer::new(&cmd);
        let reply = handler.call(msg).await;
        let success = !matches!(reply, Reply::Single(Err(_)));
        metrics::record_command(&cmd, success);
        reply
    }

    /// Dispatch in-process and return the first reply
    pub async fn act(&self, msg: Value) -> std::result::Result<Value, ReplyError> {
        match self.dispatch(msg).await {
            Reply::Single(result) => result,
            Reply::Stream { ack, .. } => Ok(ack),
        }
    }

    /// Stop dispatching and run every close hook
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing router");
        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, msg: Value) -> Reply {
            Reply::Single(Ok(msg["value"].clone()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_topic_and_cmd() {
        let router = Router::new();
        router.add("math", "echo", Arc::new(Echo)).unwrap();

        let result = router
            .act(json!({"topic": "math", "cmd": "echo", "value": 42}))
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_unknown_pattern() {
        let router = Router::new();
        router.add("math", "echo", Arc::new(Echo)).unwrap();

        let err = router.act(json!({"topic": "math", "cmd": "add"})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PatternNotFound);

        let err = router.act(json!({"cmd": "echo"})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PatternNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let router = Router::new();
        router.add("math", "echo", Arc::new(Echo)).unwrap();
        assert!(router.add("math", "echo", Arc::new(Echo)).is_err());
        assert_eq!(router.patterns(), vec![("math".to_string(), "echo".to_string())]);
    }

    #[tokio::test]
    async fn test_close_runs_hooks_once() {
        let router = Router::new();
        router.add("math", "echo", Arc::new(Echo)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router.on_close(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.close().await;
        router.close().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = router.act(json!({"topic": "math", "cmd": "echo"})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }

    #[test]
    fn test_error_wire_shape() {
        let value = serde_json::to_value(ReplyError::invalid_request("bad")).unwrap();
        assert_eq!(
            value,
            json!({"name": "ValidationError", "code": "INVALID_REQUEST", "message": "bad"})
        );
    }
}
