//! Job lifecycle
//!
//! Jobs live in one of four partitions (timer, executable, suspended, dead
//! letter). The [`JobManager`] creates them for the engine, acquires due ones
//! through the store's atomic acquisition, runs them in their own unit of
//! work and applies the retry and dead-letter policy when they fail.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AsyncExecutorConfig, EngineConfig};
use crate::context::CommandContext;
use crate::domain::events::EngineEvent;
use crate::domain::execution::ExecutionEntity;
use crate::domain::job::{JobEntity, JobState, JobType};
use crate::engine::deployment::DeployedProcess;
use crate::engine::ExecutionEngine;
use crate::store::{AcquireJobsRequest, EntityStore, Query};
use crate::types::{ExecutionId, JobId, ProcessDefinitionId};
use crate::CoreError;

/// ISO-8601 durations and repeating intervals
pub mod duration;
/// Async job executor loop
pub mod executor;
/// Job handlers
pub mod handler;

use duration::{RepeatSpec, ResolvedTimer};
use handler::{JobHandler, JobHandlerRegistry, TIMER_START_EVENT};

/// Result of running one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler ran and its unit of work was committed
    Succeeded,
    /// The handler failed; retries were decremented
    Failed(String),
    /// The job was not run, or ran into a conflict, and is left for a later acquisition
    Unlocked,
}

fn millis(value: u64) -> Result<Duration, CoreError> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| CoreError::ConfigurationError(format!("Interval of {} ms is out of range", value)))
}

fn shift(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, CoreError> {
    at.checked_add_signed(by)
        .ok_or_else(|| CoreError::ConfigurationError(format!("{} + {} overflows the calendar", at, by)))
}

/// Creates, runs, retries, suspends and dead-letters jobs
#[derive(Debug, Clone)]
pub struct JobManager {
    default_retries: u32,
    retry_wait: Duration,
    handlers: JobHandlerRegistry,
}

impl JobManager {
    /// Manager with explicit settings
    pub fn new(default_retries: u32, retry_wait: Duration, handlers: JobHandlerRegistry) -> Self {
        Self {
            default_retries,
            retry_wait,
            handlers,
        }
    }

    /// Manager with the built-in handlers and the configured retry policy
    pub fn from_config(config: &EngineConfig) -> Result<Self, CoreError> {
        Ok(Self::new(
            config.default_job_retries,
            millis(config.async_executor.retry_wait_ms)?,
            JobHandlerRegistry::with_builtin(),
        ))
    }

    /// Add or replace a handler
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.register(handler);
    }

    /// Retries given to new jobs
    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    fn bind(job: &mut JobEntity, execution: &ExecutionEntity, exclusive: bool) {
        job.execution_id = Some(execution.id.clone());
        job.process_instance_id = Some(execution.process_instance_id.clone());
        job.process_definition_id = Some(execution.process_definition_id.clone());
        job.tenant_id = execution.tenant_id.clone();
        job.exclusive = exclusive;
    }

    fn store_new(ctx: &mut CommandContext, job: JobEntity, suspended: bool) -> JobEntity {
        let job = if suspended {
            job.into_state(JobState::Suspended)
        } else {
            job
        };
        ctx.insert(job.clone());
        job
    }

    /// Create a timer job for `execution`
    pub fn schedule_timer(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        timer: ResolvedTimer,
        handler_type: &str,
        configuration: Option<String>,
        exclusive: bool,
    ) -> JobEntity {
        let mut job = JobEntity::new(
            JobState::Timer,
            JobType::Timer,
            handler_type,
            configuration,
            self.default_retries,
            ctx.now(),
        );
        Self::bind(&mut job, execution, exclusive);
        job.due_date = Some(timer.due_date);
        job.repeat = timer.repeat;
        job.end_date = timer.end_date;
        debug!(
            job_id = %job.id,
            execution_id = %execution.id,
            handler_type,
            due_date = %timer.due_date,
            "Scheduled timer"
        );
        Self::store_new(ctx, job, execution.is_suspended())
    }

    /// Create the timer job that starts `process` at the start event `node_id`
    pub fn schedule_start_timer(
        &self,
        ctx: &mut CommandContext,
        process: &DeployedProcess,
        node_id: &str,
        timer: ResolvedTimer,
    ) -> JobEntity {
        let mut job = JobEntity::new(
            JobState::Timer,
            JobType::Timer,
            TIMER_START_EVENT,
            Some(node_id.to_string()),
            self.default_retries,
            ctx.now(),
        );
        job.process_definition_id = Some(process.id().clone());
        job.tenant_id = process.tenant_id().map(str::to_string);
        job.due_date = Some(timer.due_date);
        job.repeat = timer.repeat;
        job.end_date = timer.end_date;
        debug!(
            job_id = %job.id,
            process_definition_id = %process.id(),
            due_date = %timer.due_date,
            "Scheduled start timer"
        );
        Self::store_new(ctx, job, false)
    }

    /// Create an executable job, due now, continuing `execution`
    pub fn schedule_async(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        handler_type: &str,
        configuration: Option<String>,
        exclusive: bool,
    ) -> JobEntity {
        let now = ctx.now();
        let mut job = JobEntity::new(
            JobState::Executable,
            JobType::Message,
            handler_type,
            configuration,
            self.default_retries,
            now,
        );
        Self::bind(&mut job, execution, exclusive);
        job.due_date = Some(now);
        Self::store_new(ctx, job, execution.is_suspended())
    }

    /// Lock up to `settings.max_jobs_per_acquisition` due jobs for `settings.lock_owner`
    pub async fn acquire_due_jobs(
        &self,
        store: &Arc<dyn EntityStore>,
        now: DateTime<Utc>,
        settings: &AsyncExecutorConfig,
    ) -> Result<Vec<JobEntity>, CoreError> {
        let request = AcquireJobsRequest {
            now,
            max_jobs: settings.max_jobs_per_acquisition,
            lock_owner: settings.lock_owner.clone(),
            lock_expiration_time: shift(now, millis(settings.lock_duration_ms)?)?,
            tenant_id: settings.tenant_id.clone(),
        };
        let jobs = store.acquire_jobs(request).await?;
        if !jobs.is_empty() {
            debug!(count = jobs.len(), lock_owner = %settings.lock_owner, "Acquired jobs");
        }
        Ok(jobs)
    }

    /// Run an acquired job in a fresh unit of work. Failures are recorded on
    /// the job in a separate unit of work and reported as an outcome.
    pub async fn execute(
        &self,
        engine: &ExecutionEngine,
        job: &JobEntity,
    ) -> Result<JobOutcome, CoreError> {
        let mut ctx = engine.new_context();
        let Some(current) = ctx.get::<JobEntity>(job.id.as_str()).await? else {
            debug!(job_id = %job.id, "Job vanished before it could run");
            return Ok(JobOutcome::Unlocked);
        };
        if current.state != JobState::Executable {
            debug!(job_id = %job.id, state = ?current.state, "Job no longer executable");
            return Ok(JobOutcome::Unlocked);
        }

        let result = match self.run(engine, &mut ctx, &current).await {
            Ok(()) => engine.commit(ctx).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(job_id = %current.id, handler_type = %current.handler_type, "Job executed");
                Ok(JobOutcome::Succeeded)
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %current.id, error = %e, "Job ran into a conflict");
                self.unlock(engine, &current.id).await?;
                Ok(JobOutcome::Unlocked)
            }
            Err(e) => {
                warn!(
                    job_id = %current.id,
                    handler_type = %current.handler_type,
                    error = %e,
                    "Job failed"
                );
                self.handle_failure(engine, &current.id, &e).await?;
                Ok(JobOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
        job: &JobEntity,
    ) -> Result<(), CoreError> {
        let handler = self.handlers.get(&job.handler_type)?;
        handler.execute(job, engine, ctx).await?;
        ctx.delete(job.clone());
        if job.repeat.is_some() {
            self.reschedule_repeat(ctx, job).await?;
        }
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::JobExecuted {
            job_id: job.id.clone(),
            timestamp,
        });
        Ok(())
    }

    /// Schedule the next occurrence of a repeating timer as a new job.
    /// Nothing is scheduled once the repetitions or the end date are
    /// exhausted, or when the timer's execution is gone.
    pub async fn reschedule_repeat(
        &self,
        ctx: &mut CommandContext,
        job: &JobEntity,
    ) -> Result<Option<JobEntity>, CoreError> {
        let Some(repeat) = &job.repeat else {
            return Ok(None);
        };
        if let Some(execution_id) = &job.execution_id {
            if ctx.get::<ExecutionEntity>(execution_id.as_str()).await?.is_none() {
                return Ok(None);
            }
        }
        let previous = job.due_date.unwrap_or_else(|| ctx.now());
        let Some((due_date, expression)) = RepeatSpec::parse(repeat)?.next(previous)? else {
            return Ok(None);
        };
        if job.end_date.map(|end| due_date > end).unwrap_or(false) {
            return Ok(None);
        }

        let mut next = JobEntity::new(
            JobState::Timer,
            job.job_type,
            job.handler_type.clone(),
            job.handler_configuration.clone(),
            self.default_retries,
            ctx.now(),
        );
        next.execution_id = job.execution_id.clone();
        next.process_instance_id = job.process_instance_id.clone();
        next.process_definition_id = job.process_definition_id.clone();
        next.tenant_id = job.tenant_id.clone();
        next.exclusive = job.exclusive;
        next.due_date = Some(due_date);
        next.repeat = Some(expression);
        next.end_date = job.end_date;
        debug!(job_id = %next.id, due_date = %due_date, "Scheduled next repetition");
        ctx.insert(next.clone());
        Ok(Some(next))
    }

    async fn unlock(&self, engine: &ExecutionEngine, id: &JobId) -> Result<(), CoreError> {
        let mut ctx = engine.new_context();
        if let Some(mut job) = ctx.get::<JobEntity>(id.as_str()).await? {
            job.lock = None;
            ctx.update(job);
            engine.commit(ctx).await?;
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        engine: &ExecutionEngine,
        id: &JobId,
        error: &CoreError,
    ) -> Result<(), CoreError> {
        let mut ctx = engine.new_context();
        let Some(mut job) = ctx.get::<JobEntity>(id.as_str()).await? else {
            return Ok(());
        };
        let now = ctx.now();
        job.retries = if error.is_configuration_error() {
            0
        } else {
            job.retries.saturating_sub(1)
        };
        job.lock = None;
        job.exception_message = Some(error.to_string());
        job.exception_stacktrace = Some(format!("{:?}", error));
        let retries = job.retries;
        let message = error.to_string();

        let job = if job.state == JobState::Suspended {
            job
        } else if retries == 0 {
            info!(job_id = %job.id, error = %message, "Job moved to dead letter");
            ctx.record_event(EngineEvent::JobDeadLettered {
                job_id: job.id.clone(),
                message,
                timestamp: now,
            });
            job.into_state(JobState::DeadLetter)
        } else {
            ctx.record_event(EngineEvent::JobFailed {
                job_id: job.id.clone(),
                retries,
                message,
                timestamp: now,
            });
            if self.retry_wait > Duration::zero() {
                job.due_date = Some(shift(now, self.retry_wait)?);
                job.into_state(JobState::Timer)
            } else {
                job.into_state(JobState::Executable)
            }
        };
        ctx.update(job);
        engine.commit(ctx).await?;
        Ok(())
    }

    async fn jobs_of_execution(
        ctx: &mut CommandContext,
        execution_id: &ExecutionId,
    ) -> Result<Vec<JobEntity>, CoreError> {
        ctx.query(Query::JobsByExecution(execution_id.clone())).await
    }

    /// Delete the timer, executable and suspended jobs of an execution
    pub async fn cancel_jobs_for(
        &self,
        ctx: &mut CommandContext,
        execution_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        for job in Self::jobs_of_execution(ctx, execution_id).await? {
            if job.state != JobState::DeadLetter {
                debug!(job_id = %job.id, execution_id = %execution_id, "Cancelled job");
                ctx.delete(job);
            }
        }
        Ok(())
    }

    /// Delete the dead-letter jobs of an execution
    pub async fn delete_dead_letter_jobs_for(
        &self,
        ctx: &mut CommandContext,
        execution_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        for job in Self::jobs_of_execution(ctx, execution_id).await? {
            if job.state == JobState::DeadLetter {
                ctx.delete(job);
            }
        }
        Ok(())
    }

    /// Move the timer and executable jobs of a process instance to the suspended partition
    pub async fn suspend_jobs_for(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let jobs: Vec<JobEntity> = ctx
            .query(Query::JobsByProcessInstance(process_instance_id.clone()))
            .await?;
        for job in jobs {
            if matches!(job.state, JobState::Timer | JobState::Executable) {
                ctx.update(job.into_state(JobState::Suspended));
            }
        }
        Ok(())
    }

    /// Return the suspended jobs of a process instance to the partition they came from
    pub async fn activate_jobs_for(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let jobs: Vec<JobEntity> = ctx
            .query(Query::JobsByProcessInstance(process_instance_id.clone()))
            .await?;
        for job in jobs {
            if job.state == JobState::Suspended {
                let state = job.activation_state();
                ctx.update(job.into_state(state));
            }
        }
        Ok(())
    }

    async fn job(ctx: &mut CommandContext, id: &JobId) -> Result<JobEntity, CoreError> {
        ctx.get_required::<JobEntity>(id.as_str(), CoreError::JobNotFound)
            .await
    }

    /// Overwrite the retries of a job that is not dead-lettered
    pub async fn set_job_retries(
        &self,
        ctx: &mut CommandContext,
        id: &JobId,
        retries: u32,
    ) -> Result<JobEntity, CoreError> {
        let mut job = Self::job(ctx, id).await?;
        if job.state == JobState::DeadLetter {
            return Err(CoreError::IllegalState(format!(
                "Job {} is dead-lettered; move it back to executable instead",
                id
            )));
        }
        job.retries = retries;
        ctx.update(job.clone());
        Ok(job)
    }

    /// Give a dead-letter job new retries and make it executable again
    pub async fn move_dead_letter_job_to_executable(
        &self,
        ctx: &mut CommandContext,
        id: &JobId,
        retries: u32,
    ) -> Result<JobEntity, CoreError> {
        let mut job = Self::job(ctx, id).await?;
        if job.state != JobState::DeadLetter {
            return Err(CoreError::IllegalState(format!(
                "Job {} is not dead-lettered",
                id
            )));
        }
        if retries == 0 {
            return Err(CoreError::ValidationError(
                "An executable job needs at least one retry".to_string(),
            ));
        }
        job.retries = retries;
        job.due_date = Some(ctx.now());
        let job = job.into_state(JobState::Executable);
        info!(job_id = %id, retries, "Dead-letter job moved to executable");
        ctx.update(job.clone());
        Ok(job)
    }

    /// Delete a job in any state
    pub async fn delete_job(&self, ctx: &mut CommandContext, id: &JobId) -> Result<(), CoreError> {
        let job = Self::job(ctx, id).await?;
        ctx.delete(job);
        Ok(())
    }

    /// Reassign every job of a definition to another tenant
    pub async fn change_deployment_tenant(
        &self,
        store: &Arc<dyn EntityStore>,
        process_definition_id: &ProcessDefinitionId,
        tenant_id: Option<String>,
    ) -> Result<usize, CoreError> {
        let changed = store
            .update_jobs_tenant(process_definition_id, tenant_id.clone())
            .await?;
        info!(
            process_definition_id = %process_definition_id,
            tenant_id = ?tenant_id,
            changed,
            "Changed tenant of jobs"
        );
        Ok(changed)
    }
}
