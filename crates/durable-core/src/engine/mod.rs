//! Durable workflow engine.
//!
//! - `codec`: tagged encoding of step outputs
//! - `sequence`: per-run sequence numbering
//! - `fault`: crash-injection hook
//! - `executor`: the execute-or-replay protocol
//! - `context`: the handle a workflow body calls
//! - `group`: fork/join of concurrent branches
//! - `runner`: opens a context and drives a workflow

pub mod codec;
pub mod context;
pub mod executor;
pub mod fault;
pub mod group;
pub mod runner;
pub mod sequence;

pub use context::DurableContext;
pub use executor::{StepError, StepExecutor};
pub use group::TaskGroup;
pub use runner::{Workflow, WorkflowRunner};
