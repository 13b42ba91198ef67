//! Driver contract between the store adapter and a document database

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::query::{Query, Selection};
use crate::types::ChangeEvent;

/// Live stream of changes on a selection.
///
/// The stream ends when the table is dropped or the driver is closed.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent>>;

/// A document database as seen by the adapter
#[async_trait]
pub trait Driver: Send + Sync {
    /// Execute one query chain and return its result
    async fn run(&self, query: Query) -> Result<Value>;

    /// Open a change feed on a selection
    async fn changes(&self, selection: Selection) -> Result<ChangeFeed>;

    /// Release the underlying database resources
    async fn close(&self) -> Result<()>;

    /// False once `close` has completed
    fn is_open(&self) -> bool;
}
