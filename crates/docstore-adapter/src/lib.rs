//! Store adapter for docstore
//!
//! Maps the uniform store contract (create, update, remove, replace, find,
//! count, exists and change subscriptions, plus database/table lifecycle) onto
//! driver calls. Each command is registered on a bus [`Router`] under
//! `(topic, cmd)`.
//!
//! ```rust,ignore
//! let router = Router::new();
//! StorePlugin::new(driver, config.adapter.clone()).register(&router)?;
//!
//! let reply = router
//!     .act(json!({"topic": "docstore", "cmd": "findById", "collection": "users", "id": id}))
//!     .await?;
//! ```
//!
//! [`Router`]: docstore_bus::Router

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod handlers;
pub mod plugin;
pub mod request;

pub use handlers::StoreService;
pub use plugin::{StorePlugin, COMMANDS};
pub use request::{Command, FindOptions};
