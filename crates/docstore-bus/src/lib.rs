//! Message bus for docstore
//!
//! Provides:
//! - `(topic, cmd)` pattern routing with single and streaming replies
//! - A length-delimited JSON frame protocol over TCP
//! - The server and client ends of that protocol

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod frame;
pub mod router;
pub mod server;

pub use client::{BusClient, Subscription};
pub use frame::Frame;
pub use router::{ErrorCode, Handler, Reply, ReplyError, ReplyStream, Router};
pub use server::BusServer;
