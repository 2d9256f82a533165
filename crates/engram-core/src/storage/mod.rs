//! Storage Layer
//!
//! The SQLite-backed event store and its migrations.

pub mod migrations;
mod sqlite;

pub use sqlite::{AccessStats, EventStore, Result, StoreError, StoreStats};
