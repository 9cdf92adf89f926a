//! Shared types for the durable step-execution engine.
//!
//! Step records and their status, engine configuration, and the error types
//! raised by the store and the result codec.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod step;
