//! Step store trait definitions (ports) and an in-memory implementation.
//!
//! The infrastructure layer (durable-infra) implements these traits with
//! SQLite persistence. `memory` backs unit tests and callers that want to
//! exercise workflow logic without a database file.

pub mod memory;
pub mod retry;
pub mod step;
