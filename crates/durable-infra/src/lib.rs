//! Infrastructure for the durable engine.
//!
//! Implements the store traits from `durable-core` on SQLite and resolves
//! where the database and configuration live on disk.

pub mod config;
pub mod sqlite;
