use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entity::EntityKind;
use crate::types::{ExecutionId, JobId, ProcessDefinitionId};

/// Which of the four job partitions a job currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its due date
    Timer,
    /// Due and ready to be acquired
    Executable,
    /// Owning process instance is suspended
    Suspended,
    /// Retries exhausted; needs operator action
    DeadLetter,
}

impl JobState {
    /// Store partition for jobs in this state
    pub fn entity_kind(self) -> EntityKind {
        match self {
            JobState::Timer => EntityKind::TimerJob,
            JobState::Executable => EntityKind::Job,
            JobState::Suspended => EntityKind::SuspendedJob,
            JobState::DeadLetter => EntityKind::DeadLetterJob,
        }
    }
}

/// What created the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// A timer
    Timer,
    /// An asynchronous continuation
    Message,
}

/// Acquisition lock; owner and expiration are always set together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    /// Executor holding the lock
    pub owner: String,
    /// After this instant another executor may reclaim the job
    pub expiration_time: DateTime<Utc>,
}

/// A unit of deferred work tied to an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    /// Job id, kept across state changes
    pub id: JobId,
    /// Optimistic locking revision
    pub revision: u32,
    /// Current partition
    pub state: JobState,
    /// Partition the job was in before being suspended
    #[serde(default)]
    pub suspended_from: Option<JobState>,
    /// Timer or async continuation
    pub job_type: JobType,
    /// When the job becomes due; `None` means immediately
    pub due_date: Option<DateTime<Utc>>,
    /// Execution the job resumes
    pub execution_id: Option<ExecutionId>,
    /// Process instance of that execution
    pub process_instance_id: Option<ExecutionId>,
    /// Definition the job belongs to
    pub process_definition_id: Option<ProcessDefinitionId>,
    /// Owning tenant
    pub tenant_id: Option<String>,
    /// Whether the job serializes with other exclusive jobs of its process instance
    pub exclusive: bool,
    /// Remaining attempts
    pub retries: u32,
    /// Registered handler resolving the job
    pub handler_type: String,
    /// Opaque handler input
    pub handler_configuration: Option<String>,
    /// Acquisition lock
    pub lock: Option<JobLock>,
    /// Message of the last failure
    pub exception_message: Option<String>,
    /// Detail of the last failure
    pub exception_stacktrace: Option<String>,
    /// ISO-8601 repeating interval for recurring timers
    pub repeat: Option<String>,
    /// No repetition is scheduled after this instant
    pub end_date: Option<DateTime<Utc>>,
    /// Creation time
    pub create_time: DateTime<Utc>,
}

impl JobEntity {
    /// Create a job that is not bound to any partition yet
    pub fn new(
        state: JobState,
        job_type: JobType,
        handler_type: impl Into<String>,
        handler_configuration: Option<String>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            revision: 1,
            state,
            suspended_from: None,
            job_type,
            due_date: None,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            tenant_id: None,
            exclusive: true,
            retries,
            handler_type: handler_type.into(),
            handler_configuration,
            lock: None,
            exception_message: None,
            exception_stacktrace: None,
            repeat: None,
            end_date: None,
            create_time: now,
        }
    }

    /// Move the job into another partition, keeping its id
    pub fn into_state(mut self, state: JobState) -> Self {
        match state {
            JobState::Suspended => {
                if self.state != JobState::Suspended {
                    self.suspended_from = Some(self.state);
                }
                self.lock = None;
            }
            JobState::DeadLetter => {
                self.lock = None;
                self.suspended_from = None;
            }
            JobState::Timer | JobState::Executable => {
                self.suspended_from = None;
            }
        }
        self.state = state;
        self
    }

    /// Partition the job returns to when its process instance is activated
    pub fn activation_state(&self) -> JobState {
        self.suspended_from.unwrap_or(match self.job_type {
            JobType::Timer => JobState::Timer,
            JobType::Message => JobState::Executable,
        })
    }

    /// Whether the job may be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map(|due| due <= now).unwrap_or(true)
    }

    /// Whether an unexpired lock is held at `now`
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .map(|lock| lock.expiration_time >= now)
            .unwrap_or(false)
    }

    /// Whether the job can be acquired at `now`
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Timer | JobState::Executable)
            && self.is_due(now)
            && !self.is_locked(now)
    }
}
