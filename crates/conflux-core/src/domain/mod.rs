/// Process definition graph
pub mod definition;

/// Persistent entity envelope and kinds
pub mod entity;

/// Engine events and listeners
pub mod events;

/// Execution tree nodes
pub mod execution;

/// Historic entities
pub mod history;

/// Jobs and their four states
pub mod job;

/// Message and signal subscriptions
pub mod subscription;

/// User tasks
pub mod task;

/// Runtime variables
pub mod variable;
