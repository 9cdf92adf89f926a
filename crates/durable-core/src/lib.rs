//! Durable step execution: replay-safe workflows over a single-writer store.
//!
//! This crate defines the store "ports" (`StepStore`, `StepTransaction`) that
//! the infrastructure layer (durable-infra) implements, and the engine that
//! drives a workflow through them. It depends only on `durable-types` --
//! never on `durable-infra` or any database crate.

pub mod engine;
pub mod repository;
