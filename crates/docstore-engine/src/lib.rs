//! docstore storage engine
//!
//! Embedded document database implementing the [`Driver`] contract:
//! - sled-backed tables with a database/table catalog
//! - RethinkDB-style write and config results
//! - change feeds over filtered and windowed selections
//!
//! [`Driver`]: docstore_common::Driver

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod table;
pub mod value;

mod engine;
mod feed;

pub use engine::StorageEngine;
pub use table::{Table, WriteOp};
