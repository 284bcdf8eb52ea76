//! Persistence port
//!
//! The engine only talks to storage through [`EntityStore`]. Writes are
//! collected by the unit of work and handed over as one batch; reads go
//! through typed [`Query`] values whose matching rule is shared with the
//! unit-of-work cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entity::{Entity, EntityKind};
use crate::domain::job::{JobEntity, JobState};
use crate::domain::subscription::EventType;
use crate::types::{ExecutionId, ProcessDefinitionId, TaskId};
use crate::CoreError;

/// One write of a flush batch
#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    /// Insert a new row; fails if the id already exists in the partition
    Insert(Entity),
    /// Replace a row; the stored revision must equal `expected_revision`
    Update {
        /// New content, already carrying `expected_revision + 1`
        entity: Entity,
        /// Revision read by the unit of work
        expected_revision: u32,
    },
    /// Remove a row; the stored revision must equal `expected_revision`
    Delete {
        /// Partition
        kind: EntityKind,
        /// Row id
        id: String,
        /// Revision read by the unit of work
        expected_revision: u32,
    },
}

/// Parameters of an atomic job acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireJobsRequest {
    /// Due dates at or before this instant qualify
    pub now: DateTime<Utc>,
    /// Upper bound on returned jobs
    pub max_jobs: usize,
    /// Lock owner written into acquired jobs
    pub lock_owner: String,
    /// Lock expiration written into acquired jobs
    pub lock_expiration_time: DateTime<Utc>,
    /// Only jobs of this tenant
    pub tenant_id: Option<String>,
}

/// Typed selection over one entity family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every execution of a process instance
    ExecutionsByProcessInstance(ExecutionId),
    /// Process instance started by a call activity execution
    SubProcessInstance(ExecutionId),
    /// Root executions, optionally of one definition
    ProcessInstances(Option<ProcessDefinitionId>),
    /// Jobs of an execution, in any state
    JobsByExecution(ExecutionId),
    /// Jobs of a process instance, in any state
    JobsByProcessInstance(ExecutionId),
    /// Jobs of a definition, in any state
    JobsByProcessDefinition(ProcessDefinitionId),
    /// Jobs in one state
    JobsInState(JobState),
    /// Open tasks of an execution
    TasksByExecution(ExecutionId),
    /// Open tasks of a process instance
    TasksByProcessInstance(ExecutionId),
    /// Open tasks assigned to a user
    TasksByAssignee(String),
    /// Variables owned by an execution
    VariablesByExecution(ExecutionId),
    /// One variable owned by an execution
    VariableByName {
        /// Owning execution
        execution_id: ExecutionId,
        /// Name
        name: String,
    },
    /// Subscriptions of an execution
    EventSubscriptionsByExecution(ExecutionId),
    /// Subscriptions for an event name
    EventSubscriptionsByName {
        /// Message or signal
        event_type: EventType,
        /// Event name
        event_name: String,
    },
    /// Unfinished historic activity instance for `(execution_id, activity_id)`
    UnfinishedHistoricActivityInstance {
        /// Execution
        execution_id: ExecutionId,
        /// Node id
        activity_id: String,
    },
    /// Historic activity instances of a process instance
    HistoricActivityInstancesByProcessInstance(ExecutionId),
    /// Historic tasks of a process instance
    HistoricTaskInstancesByProcessInstance(ExecutionId),
    /// Historic variables of a process instance
    HistoricVariableInstancesByProcessInstance(ExecutionId),
    /// Variable update trail of a process instance
    HistoricDetailsByProcessInstance(ExecutionId),
    /// Identity links of a task
    HistoricIdentityLinksByTask(TaskId),
}

impl Query {
    /// Family the query selects from
    pub fn kind(&self) -> EntityKind {
        match self {
            Query::ExecutionsByProcessInstance(_)
            | Query::SubProcessInstance(_)
            | Query::ProcessInstances(_) => EntityKind::Execution,
            Query::JobsByExecution(_)
            | Query::JobsByProcessInstance(_)
            | Query::JobsByProcessDefinition(_)
            | Query::JobsInState(_) => EntityKind::Job,
            Query::TasksByExecution(_)
            | Query::TasksByProcessInstance(_)
            | Query::TasksByAssignee(_) => EntityKind::Task,
            Query::VariablesByExecution(_) | Query::VariableByName { .. } => {
                EntityKind::VariableInstance
            }
            Query::EventSubscriptionsByExecution(_) | Query::EventSubscriptionsByName { .. } => {
                EntityKind::EventSubscription
            }
            Query::UnfinishedHistoricActivityInstance { .. }
            | Query::HistoricActivityInstancesByProcessInstance(_) => {
                EntityKind::HistoricActivityInstance
            }
            Query::HistoricTaskInstancesByProcessInstance(_) => EntityKind::HistoricTaskInstance,
            Query::HistoricVariableInstancesByProcessInstance(_) => {
                EntityKind::HistoricVariableInstance
            }
            Query::HistoricDetailsByProcessInstance(_) => EntityKind::HistoricDetail,
            Query::HistoricIdentityLinksByTask(_) => EntityKind::HistoricIdentityLink,
        }
    }

    /// Whether `entity` is selected by this query
    pub fn matches(&self, entity: &Entity) -> bool {
        match (self, entity) {
            (Query::ExecutionsByProcessInstance(pi), Entity::Execution(e)) => {
                &e.process_instance_id == pi
            }
            (Query::SubProcessInstance(sup), Entity::Execution(e)) => {
                e.super_execution_id.as_ref() == Some(sup)
            }
            (Query::ProcessInstances(def), Entity::Execution(e)) => {
                e.parent_id.is_none()
                    && def
                        .as_ref()
                        .map(|d| &e.process_definition_id == d)
                        .unwrap_or(true)
            }
            (Query::JobsByExecution(id), Entity::Job(j)) => j.execution_id.as_ref() == Some(id),
            (Query::JobsByProcessInstance(id), Entity::Job(j)) => {
                j.process_instance_id.as_ref() == Some(id)
            }
            (Query::JobsByProcessDefinition(id), Entity::Job(j)) => {
                j.process_definition_id.as_ref() == Some(id)
            }
            (Query::JobsInState(state), Entity::Job(j)) => &j.state == state,
            (Query::TasksByExecution(id), Entity::Task(t)) => &t.execution_id == id,
            (Query::TasksByProcessInstance(id), Entity::Task(t)) => &t.process_instance_id == id,
            (Query::TasksByAssignee(user), Entity::Task(t)) => {
                t.assignee.as_deref() == Some(user.as_str())
            }
            (Query::VariablesByExecution(id), Entity::Variable(v)) => &v.execution_id == id,
            (Query::VariableByName { execution_id, name }, Entity::Variable(v)) => {
                &v.execution_id == execution_id && &v.name == name
            }
            (Query::EventSubscriptionsByExecution(id), Entity::EventSubscription(s)) => {
                &s.execution_id == id
            }
            (
                Query::EventSubscriptionsByName {
                    event_type,
                    event_name,
                },
                Entity::EventSubscription(s),
            ) => &s.event_type == event_type && &s.event_name == event_name,
            (
                Query::UnfinishedHistoricActivityInstance {
                    execution_id,
                    activity_id,
                },
                Entity::HistoricActivityInstance(h),
            ) => {
                h.end_time.is_none()
                    && &h.execution_id == execution_id
                    && &h.activity_id == activity_id
            }
            (
                Query::HistoricActivityInstancesByProcessInstance(pi),
                Entity::HistoricActivityInstance(h),
            ) => &h.process_instance_id == pi,
            (Query::HistoricTaskInstancesByProcessInstance(pi), Entity::HistoricTaskInstance(h)) => {
                &h.process_instance_id == pi
            }
            (
                Query::HistoricVariableInstancesByProcessInstance(pi),
                Entity::HistoricVariableInstance(h),
            ) => &h.process_instance_id == pi,
            (Query::HistoricDetailsByProcessInstance(pi), Entity::HistoricDetail(h)) => {
                &h.process_instance_id == pi
            }
            (Query::HistoricIdentityLinksByTask(task), Entity::HistoricIdentityLink(h)) => {
                &h.task_id == task
            }
            _ => false,
        }
    }
}

/// Durable storage for every engine entity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Apply a batch atomically: either every operation succeeds or none does.
    /// A revision mismatch fails with [`CoreError::OptimisticLockingFailure`].
    async fn flush(&self, operations: Vec<DbOperation>) -> Result<(), CoreError>;

    /// Look up one entity by id; for [`EntityKind::Job`] every job partition is searched
    async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, CoreError>;

    /// All entities selected by `query`, in insertion order
    async fn select_list(&self, query: Query) -> Result<Vec<Entity>, CoreError>;

    /// First entity selected by `query`
    async fn select_one(&self, query: Query) -> Result<Option<Entity>, CoreError> {
        Ok(self.select_list(query).await?.into_iter().next())
    }

    /// Atomically lock due jobs. Due timers move to the executable partition,
    /// and no two exclusive jobs of one process instance are ever locked at once.
    async fn acquire_jobs(&self, request: AcquireJobsRequest) -> Result<Vec<JobEntity>, CoreError>;

    /// Reassign every job of a definition to another tenant; returns the number of rows changed
    async fn update_jobs_tenant(
        &self,
        process_definition_id: &ProcessDefinitionId,
        tenant_id: Option<String>,
    ) -> Result<usize, CoreError>;
}
