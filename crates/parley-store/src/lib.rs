//! # parley-store
//!
//! Durable local cache of conversations and messages, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers and predicate
//! queries for every domain model. It owns no synchronization logic: merge
//! decisions are made by the caller and handed over as a [`ChangeSet`], which
//! is applied inside a single transaction.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;
mod time;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
