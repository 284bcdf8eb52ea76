use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::JobOutcome;
use crate::engine::ExecutionEngine;
use crate::CoreError;

/// Polls the store for due jobs and runs them, one acquisition cycle per poll interval
pub struct AsyncJobExecutor {
    engine: Arc<ExecutionEngine>,
}

/// Running executor loop
pub struct ExecutorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Stop polling and wait for the cycle in progress to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Job executor task ended abnormally");
        }
    }
}

impl AsyncJobExecutor {
    /// Executor running jobs on `engine`
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Acquire due jobs once and run them in due-date order
    pub async fn run_once(&self) -> Result<Vec<JobOutcome>, CoreError> {
        let engine = &self.engine;
        let now = engine.clock().now();
        let jobs = engine
            .jobs()
            .acquire_due_jobs(engine.store(), now, &engine.config().async_executor)
            .await?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in &jobs {
            outcomes.push(engine.jobs().execute(engine, job).await?);
        }
        Ok(outcomes)
    }

    /// Start the polling loop on the tokio runtime
    pub fn start(self) -> ExecutorHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let interval = self.engine.config().async_executor.poll_interval();
        let task = tokio::spawn(async move {
            debug!(poll_interval_ms = interval.as_millis() as u64, "Job executor started");
            loop {
                match self.run_once().await {
                    Ok(outcomes) if !outcomes.is_empty() => {
                        debug!(executed = outcomes.len(), "Job acquisition cycle finished");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Job acquisition cycle failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Job executor stopped");
        });
        ExecutorHandle { shutdown, task }
    }
}
