//! docstore Common - Shared types and contracts
//!
//! This crate provides functionality shared by every docstore component:
//! - Error types and handling
//! - Configuration management
//! - The query chain and the `Driver` contract the adapter issues calls through
//! - Metrics helpers

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod query;
pub mod types;

pub use config::Config;
pub use driver::{ChangeFeed, Driver};
pub use error::{Error, Result};
pub use query::Query;
pub use types::*;
