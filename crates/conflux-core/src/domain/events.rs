use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, JobId, ProcessDefinitionId, TaskId};
use crate::CoreError;

/// Something that happened inside a committed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A process definition was deployed
    ProcessDeployed {
        /// Deployed definition id
        process_definition_id: ProcessDefinitionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A process instance was started
    ProcessStarted {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Definition that was started
        process_definition_id: ProcessDefinitionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A process instance reached its end
    ProcessCompleted {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A process instance was deleted before completing
    ProcessCancelled {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Given reason
        reason: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A process instance was suspended
    ProcessSuspended {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A process instance was activated
    ProcessActivated {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// An execution entered a node
    ActivityStarted {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Execution id
        execution_id: ExecutionId,
        /// Node id
        activity_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// An execution left a node
    ActivityCompleted {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Execution id
        execution_id: ExecutionId,
        /// Node id
        activity_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A user task was created
    TaskCreated {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Task id
        task_id: TaskId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A user task was completed
    TaskCompleted {
        /// Process instance id
        process_instance_id: ExecutionId,
        /// Task id
        task_id: TaskId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A job ran successfully
    JobExecuted {
        /// Job id
        job_id: JobId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A job failed and has retries left
    JobFailed {
        /// Job id
        job_id: JobId,
        /// Retries left
        retries: u32,
        /// Failure message
        message: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A job ran out of retries
    JobDeadLettered {
        /// Job id
        job_id: JobId,
        /// Failure message
        message: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Dotted event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::ProcessDeployed { .. } => "process_definition.deployed",
            EngineEvent::ProcessStarted { .. } => "process_instance.started",
            EngineEvent::ProcessCompleted { .. } => "process_instance.completed",
            EngineEvent::ProcessCancelled { .. } => "process_instance.cancelled",
            EngineEvent::ProcessSuspended { .. } => "process_instance.suspended",
            EngineEvent::ProcessActivated { .. } => "process_instance.activated",
            EngineEvent::ActivityStarted { .. } => "activity.started",
            EngineEvent::ActivityCompleted { .. } => "activity.completed",
            EngineEvent::TaskCreated { .. } => "task.created",
            EngineEvent::TaskCompleted { .. } => "task.completed",
            EngineEvent::JobExecuted { .. } => "job.executed",
            EngineEvent::JobFailed { .. } => "job.failed",
            EngineEvent::JobDeadLettered { .. } => "job.dead_lettered",
        }
    }

    /// Process instance the event concerns, if any
    pub fn process_instance_id(&self) -> Option<&ExecutionId> {
        match self {
            EngineEvent::ProcessStarted { process_instance_id, .. }
            | EngineEvent::ProcessCompleted { process_instance_id, .. }
            | EngineEvent::ProcessCancelled { process_instance_id, .. }
            | EngineEvent::ProcessSuspended { process_instance_id, .. }
            | EngineEvent::ProcessActivated { process_instance_id, .. }
            | EngineEvent::ActivityStarted { process_instance_id, .. }
            | EngineEvent::ActivityCompleted { process_instance_id, .. }
            | EngineEvent::TaskCreated { process_instance_id, .. }
            | EngineEvent::TaskCompleted { process_instance_id, .. } => Some(process_instance_id),
            EngineEvent::ProcessDeployed { .. }
            | EngineEvent::JobExecuted { .. }
            | EngineEvent::JobFailed { .. }
            | EngineEvent::JobDeadLettered { .. } => None,
        }
    }
}

/// Receives engine events after their unit of work committed
#[async_trait]
pub trait EngineEventListener: Send + Sync {
    /// Handle one event; errors are logged and do not affect the engine
    async fn handle_event(&self, event: &EngineEvent) -> Result<(), CoreError>;
}
