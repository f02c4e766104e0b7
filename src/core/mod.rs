//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: append-only fact log per execution
//! - ExecutionLocks: per-execution advisory locks
//! - Pipeline: definitions, retry/loop/for-each config, providers
//! - Planner: pure planning and continuation decisions
//! - Credentials: credential providers and the TTL cache
//! - Dispatcher: ordered delivery of facts to handlers
//! - Engine: public facade over all of the above

pub mod credentials;
pub mod dispatch;
pub mod engine;
pub mod event_store;
pub mod locks;
pub mod pipeline;
pub mod planner;

// Re-export commonly used types
pub use credentials::{CachedCredentialProvider, CredentialError, CredentialProvider, EnvCredentialProvider};
pub use dispatch::{Completion, DispatchError, DispatchSettings, Dispatcher};
pub use engine::{Engine, EngineBuilder, ExecutionSummary, StartedExecution};
pub use event_store::EventStore;
pub use locks::ExecutionLocks;
pub use pipeline::{DefinitionProvider, InMemoryDefinitions, PipelineDefinition, RetryPolicy, StepDefinition};
