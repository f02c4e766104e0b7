//! pipewright - Event-sourced pipeline execution engine
//!
//! Executes DAG-shaped pipelines of steps. Every state change is recorded
//! as an immutable fact in a per-execution log, and the current state of
//! an execution is always rebuilt by replaying that log.
//!
//! # Architecture
//!
//! - Commands express intent, events record what happened
//! - Handlers read the replayed aggregate and emit new facts
//! - Facts of one execution are delivered in append order
//! - A handler failure fails the affected pipeline instead of stalling it
//!
//! # Modules
//!
//! - `domain`: Facts, the execution aggregate and step lifecycle
//! - `core`: Event store, planner, dispatcher and the `Engine` facade
//! - `adapters`: Step runners (http, exec)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! pipewright run hello --arg name=world
//!
//! # Check execution status
//! pipewright status <execution-id>
//!
//! # Follow the fact log
//! pipewright log <execution-id> --follow
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Completion, Engine, EventStore, PipelineDefinition};
pub use domain::{Command, Event, Execution, LogEntry, Message, PipelineStatus};
