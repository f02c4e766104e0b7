//! Domain types for the pipewright engine.
//!
//! This module contains the core data structures:
//! - Events: the closed set of commands and events stored in the log
//! - Execution: the aggregate rebuilt by replaying the log
//! - Step: step executions and per-step progress tracking
//! - Errors: step errors and their aggregation

pub mod errors;
pub mod events;
pub mod execution;
pub mod ids;
pub mod step;

// Re-export commonly used types
pub use errors::{merge_errors, FailureMode, StepError};
pub use events::{Command, Envelope, Event, LogEntry, Message};
pub use execution::{Execution, ExecutionError, PipelineExecution, PipelineStatus};
pub use step::{StepExecution, StepExecutionStatus, StepForEach, StepInput, StepLoop, StepOutput, StepRetry, StepStatus};
