//!
//! Conflux Core - process execution engine
//!
//! This crate interprets deployed process graphs as a persistent tree of
//! executions. It contains the domain model, the storage port, the
//! unit-of-work context, activity behaviors, the job lifecycle and the
//! level-gated history mirror, plus the [`ProcessEngine`] facade that ties
//! them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Application services - the engine API
pub mod application;

/// Activity behaviors per node kind
pub mod behavior;

/// Engine configuration
pub mod config;

/// Unit of work
pub mod context;

/// Domain layer - entities, definitions and events
pub mod domain;

/// Execution tree interpreter
pub mod engine;

/// Error types
pub mod error;

/// Audit trail
pub mod history;

/// Jobs, timers and the async executor
pub mod job;

/// Persistence port
pub mod store;

/// Core types and traits
pub mod types;

// Re-export key types
pub use error::CoreError;
pub use types::{
    Clock, ExecutionId, JobId, ManualClock, ProcessDefinitionId, SystemClock, TaskId, VariableMap,
};

// Re-export main API types for easy use
pub use application::{ProcessEngine, ProcessEngineBuilder};
pub use behavior::{
    ActivityBehavior, ActivityExecution, ConditionEvaluator, DelegateInput, ServiceTaskDelegate,
};
pub use config::{AsyncExecutorConfig, EngineConfig};
pub use context::CommandContext;
pub use domain::definition::{
    BoundaryEventDefinition, CatchEventDefinition, MultiInstanceConfig, Node, NodeKind,
    ProcessDefinition, TimerDefinition,
};
pub use domain::events::{EngineEvent, EngineEventListener};
pub use domain::execution::{ExecutionEntity, ScopeKind, SuspensionState};
pub use domain::job::{JobEntity, JobState};
pub use domain::task::TaskEntity;
pub use history::{HistoryLevel, HistoryManager};
pub use job::JobOutcome;
pub use store::{AcquireJobsRequest, DbOperation, EntityStore, Query};
