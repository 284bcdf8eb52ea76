//! History manager
//!
//! Mirrors runtime lifecycle transitions into the historic entities. Every
//! recording call is gated by the configured [`HistoryLevel`] and goes through
//! the unit-of-work cache before the store so that repeated calls within one
//! unit of work never create duplicate rows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::context::CommandContext;
use crate::domain::definition::Node;
use crate::domain::entity::EntityKind;
use crate::domain::execution::ExecutionEntity;
use crate::domain::history::{
    elapsed_ms, HistoricActivityInstance, HistoricDetail, HistoricIdentityLink,
    HistoricProcessInstance, HistoricTaskInstance, HistoricVariableInstance, IdentityLinkType,
};
use crate::domain::task::TaskEntity;
use crate::domain::variable::VariableInstance;
use crate::store::Query;
use crate::types::{ExecutionId, TaskId};
use crate::CoreError;

/// How much audit data is recorded, in increasing order of detail
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HistoryLevel {
    /// Nothing
    None,
    /// Process instances, activity instances and variable values
    Activity,
    /// Additionally tasks and identity links
    #[default]
    Audit,
    /// Additionally every variable update
    Full,
}

impl fmt::Display for HistoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HistoryLevel::None => "none",
            HistoryLevel::Activity => "activity",
            HistoryLevel::Audit => "audit",
            HistoryLevel::Full => "full",
        };
        f.write_str(name)
    }
}

impl FromStr for HistoryLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(HistoryLevel::None),
            "activity" => Ok(HistoryLevel::Activity),
            "audit" => Ok(HistoryLevel::Audit),
            "full" => Ok(HistoryLevel::Full),
            other => Err(CoreError::ConfigurationError(format!(
                "Unknown history level: {}",
                other
            ))),
        }
    }
}

/// Level-gated writer of historic entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryManager {
    level: HistoryLevel,
}

impl HistoryManager {
    /// Create a manager recording at `level`
    pub fn new(level: HistoryLevel) -> Self {
        Self { level }
    }

    /// Configured level
    pub fn level(&self) -> HistoryLevel {
        self.level
    }

    /// Whether anything is recorded at all
    pub fn is_enabled(&self) -> bool {
        self.level > HistoryLevel::None
    }

    /// Whether the configured level includes `level`
    pub fn is_at_least(&self, level: HistoryLevel) -> bool {
        self.level >= level
    }

    // ---- process instances ----

    /// Record the start of a process instance
    pub fn record_process_instance_start(
        &self,
        ctx: &mut CommandContext,
        process_instance: &ExecutionEntity,
        super_process_instance_id: Option<ExecutionId>,
    ) {
        if !self.is_at_least(HistoryLevel::Activity) {
            return;
        }
        ctx.insert(HistoricProcessInstance {
            id: process_instance.id.to_string(),
            revision: 1,
            process_definition_id: process_instance.process_definition_id.clone(),
            business_key: process_instance.business_key.clone(),
            super_process_instance_id,
            start_activity_id: process_instance.activity_id.clone(),
            end_activity_id: None,
            start_time: process_instance.start_time,
            end_time: None,
            duration_ms: None,
            delete_reason: None,
            tenant_id: process_instance.tenant_id.clone(),
        });
    }

    /// Record the end of a process instance
    pub async fn record_process_instance_end(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
        end_activity_id: Option<String>,
        delete_reason: Option<String>,
    ) -> Result<(), CoreError> {
        if !self.is_at_least(HistoryLevel::Activity) {
            return Ok(());
        }
        let Some(mut historic) = ctx
            .get::<HistoricProcessInstance>(process_instance_id.as_str())
            .await?
        else {
            return Ok(());
        };
        let now = ctx.now();
        historic.end_time = Some(now);
        historic.duration_ms = Some(elapsed_ms(historic.start_time, now));
        historic.end_activity_id = end_activity_id;
        historic.delete_reason = delete_reason;
        ctx.update(historic);
        Ok(())
    }

    // ---- activity instances ----

    /// Locate the unfinished historic activity instance of `execution`'s
    /// current activity, creating one from `create` when none exists.
    ///
    /// Lookup order per execution: unit-of-work cache, then the store (skipped
    /// for executions inserted in this unit of work), then the parent
    /// execution. The walk stops at the process instance and never crosses
    /// into a calling process.
    pub async fn find_or_create_historic_activity_instance(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        create: Option<&Node>,
    ) -> Result<Option<HistoricActivityInstance>, CoreError> {
        if !self.is_at_least(HistoryLevel::Activity) {
            return Ok(None);
        }
        let Some(activity_id) = execution.activity_id.clone() else {
            return Ok(None);
        };

        let mut current = Some(execution.clone());
        while let Some(candidate) = current {
            let cached = ctx.find_in_cache::<HistoricActivityInstance>(|h| {
                h.end_time.is_none()
                    && h.execution_id == candidate.id
                    && h.activity_id == activity_id
            });
            if cached.is_some() {
                return Ok(cached);
            }

            if !ctx.is_inserted(EntityKind::Execution, candidate.id.as_str()) {
                let stored = ctx
                    .query_one::<HistoricActivityInstance>(
                        Query::UnfinishedHistoricActivityInstance {
                            execution_id: candidate.id.clone(),
                            activity_id: activity_id.clone(),
                        },
                    )
                    .await?;
                if stored.is_some() {
                    return Ok(stored);
                }
            }

            current = match &candidate.parent_id {
                Some(parent_id) => ctx.get::<ExecutionEntity>(parent_id.as_str()).await?,
                None => None,
            };
        }

        let Some(node) = create else {
            return Ok(None);
        };
        let created = HistoricActivityInstance {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            process_instance_id: execution.process_instance_id.clone(),
            execution_id: execution.id.clone(),
            process_definition_id: execution.process_definition_id.clone(),
            activity_id,
            activity_name: node.name.clone(),
            activity_type: node.type_name().to_string(),
            task_id: None,
            called_process_instance_id: None,
            start_time: ctx.now(),
            end_time: None,
            duration_ms: None,
            delete_reason: None,
            tenant_id: execution.tenant_id.clone(),
        };
        ctx.insert(created.clone());
        Ok(Some(created))
    }

    /// Record that `execution` entered `node`
    pub async fn record_activity_start(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        node: &Node,
    ) -> Result<(), CoreError> {
        self.find_or_create_historic_activity_instance(ctx, execution, Some(node))
            .await
            .map(|_| ())
    }

    /// Record that `execution` left its current activity
    pub async fn record_activity_end(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        delete_reason: Option<&str>,
    ) -> Result<(), CoreError> {
        let Some(mut historic) = self
            .find_or_create_historic_activity_instance(ctx, execution, None)
            .await?
        else {
            return Ok(());
        };
        let now = ctx.now();
        historic.end_time = Some(now);
        historic.duration_ms = Some(elapsed_ms(historic.start_time, now));
        historic.delete_reason = delete_reason.map(str::to_string);
        ctx.update(historic);
        Ok(())
    }

    /// Link the current activity instance of `execution` to a created task
    pub async fn record_task_id(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        task_id: &TaskId,
    ) -> Result<(), CoreError> {
        if let Some(mut historic) = self
            .find_or_create_historic_activity_instance(ctx, execution, None)
            .await?
        {
            historic.task_id = Some(task_id.clone());
            ctx.update(historic);
        }
        Ok(())
    }

    /// Link the current activity instance of `execution` to a called process instance
    pub async fn record_called_process_instance(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        called: &ExecutionId,
    ) -> Result<(), CoreError> {
        if let Some(mut historic) = self
            .find_or_create_historic_activity_instance(ctx, execution, None)
            .await?
        {
            historic.called_process_instance_id = Some(called.clone());
            ctx.update(historic);
        }
        Ok(())
    }

    // ---- tasks ----

    /// Record a created task and its identity links
    pub fn record_task_created(&self, ctx: &mut CommandContext, task: &TaskEntity) {
        if !self.is_at_least(HistoryLevel::Audit) {
            return;
        }
        ctx.insert(HistoricTaskInstance {
            id: task.id.to_string(),
            revision: 1,
            process_instance_id: task.process_instance_id.clone(),
            execution_id: task.execution_id.clone(),
            process_definition_id: task.process_definition_id.clone(),
            task_definition_key: task.task_definition_key.clone(),
            name: task.name.clone(),
            assignee: task.assignee.clone(),
            priority: task.priority,
            start_time: task.create_time,
            claim_time: None,
            end_time: None,
            duration_ms: None,
            delete_reason: None,
            tenant_id: task.tenant_id.clone(),
        });

        if let Some(assignee) = &task.assignee {
            self.insert_identity_link(ctx, task, IdentityLinkType::Assignee, Some(assignee), None);
        }
        for user in &task.candidate_users {
            self.insert_identity_link(ctx, task, IdentityLinkType::Candidate, Some(user), None);
        }
        for group in &task.candidate_groups {
            self.insert_identity_link(ctx, task, IdentityLinkType::Candidate, None, Some(group));
        }
    }

    fn insert_identity_link(
        &self,
        ctx: &mut CommandContext,
        task: &TaskEntity,
        link_type: IdentityLinkType,
        user_id: Option<&String>,
        group_id: Option<&String>,
    ) {
        let create_time = ctx.now();
        ctx.insert(HistoricIdentityLink {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            task_id: task.id.clone(),
            process_instance_id: task.process_instance_id.clone(),
            link_type,
            user_id: user_id.cloned(),
            group_id: group_id.cloned(),
            create_time,
        });
    }

    /// Record a new assignee of a task
    pub async fn record_task_assignment(
        &self,
        ctx: &mut CommandContext,
        task: &TaskEntity,
    ) -> Result<(), CoreError> {
        if !self.is_at_least(HistoryLevel::Audit) {
            return Ok(());
        }
        if let Some(mut historic) = ctx.get::<HistoricTaskInstance>(task.id.as_str()).await? {
            historic.assignee = task.assignee.clone();
            historic.claim_time = Some(ctx.now());
            ctx.update(historic);
        }
        if let Some(assignee) = &task.assignee {
            self.insert_identity_link(ctx, task, IdentityLinkType::Assignee, Some(assignee), None);
        }
        Ok(())
    }

    /// Record the end of a task; `reason` is `completed` or why it was removed
    pub async fn record_task_end(
        &self,
        ctx: &mut CommandContext,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<(), CoreError> {
        if !self.is_at_least(HistoryLevel::Audit) {
            return Ok(());
        }
        if let Some(mut historic) = ctx.get::<HistoricTaskInstance>(task_id.as_str()).await? {
            let now = ctx.now();
            historic.end_time = Some(now);
            historic.duration_ms = Some(elapsed_ms(historic.start_time, now));
            historic.delete_reason = Some(reason.to_string());
            ctx.update(historic);
        }
        Ok(())
    }

    // ---- variables ----

    /// Record the first write of a runtime variable
    pub fn record_variable_create(&self, ctx: &mut CommandContext, variable: &VariableInstance) {
        if !self.is_at_least(HistoryLevel::Activity) {
            return;
        }
        let now = ctx.now();
        ctx.insert(HistoricVariableInstance {
            id: variable.id.clone(),
            revision: 1,
            name: variable.name.clone(),
            process_instance_id: variable.process_instance_id.clone(),
            execution_id: variable.execution_id.clone(),
            task_id: variable.task_id.clone(),
            value: variable.value.clone(),
            create_time: now,
            last_updated_time: now,
        });
        self.record_variable_detail(ctx, variable);
    }

    /// Record a later write of a runtime variable, looking its mirror up by variable id
    pub async fn record_variable_update(
        &self,
        ctx: &mut CommandContext,
        variable: &VariableInstance,
    ) -> Result<(), CoreError> {
        if !self.is_at_least(HistoryLevel::Activity) {
            return Ok(());
        }
        match ctx.get::<HistoricVariableInstance>(&variable.id).await? {
            Some(mut historic) => {
                historic.value = variable.value.clone();
                historic.last_updated_time = ctx.now();
                ctx.update(historic);
                self.record_variable_detail(ctx, variable);
            }
            None => self.record_variable_create(ctx, variable),
        }
        Ok(())
    }

    fn record_variable_detail(&self, ctx: &mut CommandContext, variable: &VariableInstance) {
        if !self.is_at_least(HistoryLevel::Full) {
            return;
        }
        let activity_instance_id = ctx
            .find_in_cache::<HistoricActivityInstance>(|h| {
                h.end_time.is_none() && h.execution_id == variable.execution_id
            })
            .map(|h| h.id);
        let time = ctx.now();
        ctx.insert(HistoricDetail {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            process_instance_id: variable.process_instance_id.clone(),
            execution_id: variable.execution_id.clone(),
            activity_instance_id,
            variable_instance_id: variable.id.clone(),
            name: variable.name.clone(),
            value: variable.value.clone(),
            variable_revision: variable.revision,
            time,
        });
    }
}
