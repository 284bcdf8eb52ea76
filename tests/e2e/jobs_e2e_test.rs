//! Job lifecycle end to end: timers driven by a manual clock, async
//! continuations, retries, dead letters and suspension

use chrono::Duration;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use conflux_core::domain::definition::CatchEventDefinition;
use conflux_core::domain::entity::EntityKind;
use conflux_core::{
    CoreError, JobOutcome, JobState, Node, NodeKind, ProcessDefinition, ProcessDefinitionId,
    TimerDefinition,
};
use conflux_tests::{start_time, vars, FlakyDelegate, RecordingDelegate, TestEngine};
use pretty_assertions::assert_eq;
use serde_json::json;

fn wait_five_minutes() -> ProcessDefinition {
    ProcessDefinition::new("reminder")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new(
            "wait",
            NodeKind::IntermediateCatchEvent {
                event: CatchEventDefinition::Timer(TimerDefinition::Duration("PT5M".to_string())),
            },
        ))
        .node(Node::new(
            "follow_up",
            NodeKind::UserTask {
                assignee: None,
                candidate_users: Vec::new(),
                candidate_groups: Vec::new(),
                priority: 50,
            },
        ))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "wait")
        .flow("f2", "wait", "follow_up")
        .flow("f3", "follow_up", "end")
}

#[tokio::test]
async fn test_timer_catch_event_fires_when_due() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(wait_five_minutes()).await?;
    let pi = t
        .engine
        .start_process_instance("reminder", vars(json!({})))
        .await?;

    let jobs = t.engine.jobs(&pi).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Timer);
    assert_eq!(jobs[0].due_date, Some(start_time() + Duration::minutes(5)));

    t.advance(Duration::minutes(4));
    assert!(t.engine.run_due_jobs().await?.is_empty());
    let executions = t.engine.executions(&pi).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].activity_id.as_deref(), Some("wait"));

    t.advance(Duration::minutes(1));
    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    // resumed right after the timer node
    let executions = t.engine.executions(&pi).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].activity_id.as_deref(), Some("follow_up"));
    assert_eq!(t.open_task_keys(&pi).await, vec!["follow_up"]);
    assert!(t.engine.jobs(&pi).await?.is_empty());
    assert_eq!(t.store.count(EntityKind::TimerJob).await, 0);
    assert!(t.listener.event_types().contains(&"job.executed"));

    let wait = t
        .engine
        .historic_activity_instances(&pi)
        .await?
        .into_iter()
        .find(|a| a.activity_id == "wait")
        .expect("timer record");
    assert_eq!(wait.end_time, Some(start_time() + Duration::minutes(5)));
    Ok(())
}

fn async_payment() -> ProcessDefinition {
    ProcessDefinition::new("payment")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(
            Node::new(
                "charge",
                NodeKind::ServiceTask {
                    delegate: "charge-card".to_string(),
                    fields: Default::default(),
                },
            )
            .async_before(),
        )
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "charge")
        .flow("f2", "charge", "end")
}

#[tokio::test]
async fn test_failing_job_is_retried_then_dead_lettered() -> anyhow::Result<()> {
    let delegate = Arc::new(FlakyDelegate::broken());
    let t = TestEngine::builder()
        .job_retries(2)
        .delegate("charge-card", delegate.clone())
        .build();
    t.engine.deploy(async_payment()).await?;
    let pi = t
        .engine
        .start_process_instance("payment", vars(json!({ "amount": 30 })))
        .await?;

    // the start commits before the delegate runs
    let jobs = t.engine.jobs(&pi).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Executable);
    assert_eq!(delegate.attempts(), 0);
    let job_id = jobs[0].id.clone();

    let outcomes = t.engine.run_due_jobs().await?;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed(_)]));
    let job = t.engine.job(&job_id).await?.expect("job after first failure");
    assert_eq!(job.state, JobState::Executable);
    assert_eq!(job.retries, 1);
    assert!(job.lock.is_none());
    assert!(job
        .exception_message
        .as_deref()
        .unwrap_or_default()
        .contains("payment gateway unavailable"));

    t.engine.run_due_jobs().await?;
    let job = t.engine.job(&job_id).await?.expect("dead-letter job");
    assert_eq!(job.state, JobState::DeadLetter);
    assert_eq!(job.retries, 0);
    assert_eq!(delegate.attempts(), 2);

    // dead letters are never acquired
    assert!(t.engine.run_due_jobs().await?.is_empty());
    assert!(t.is_running(&pi).await);
    assert_eq!(t.engine.jobs_in_state(JobState::DeadLetter).await?.len(), 1);
    assert!(t.listener.event_types().contains(&"job.dead_lettered"));

    // an operator fixes the cause and hands the job back
    delegate.repair();
    t.engine
        .move_dead_letter_job_to_executable(&job_id, 1)
        .await?;
    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert!(!t.is_running(&pi).await);
    Ok(())
}

#[tokio::test]
async fn test_failed_job_waits_for_retry_delay() -> anyhow::Result<()> {
    let delegate = Arc::new(FlakyDelegate::broken());
    let t = TestEngine::builder()
        .job_retries(3)
        .retry_wait(Duration::seconds(30))
        .delegate("charge-card", delegate.clone())
        .build();
    t.engine.deploy(async_payment()).await?;
    let pi = t
        .engine
        .start_process_instance("payment", vars(json!({})))
        .await?;

    t.engine.run_due_jobs().await?;
    let job = t.engine.jobs(&pi).await?.remove(0);
    assert_eq!(job.state, JobState::Timer);
    assert_eq!(job.retries, 2);
    assert_eq!(job.due_date, Some(start_time() + Duration::seconds(30)));

    assert!(t.engine.run_due_jobs().await?.is_empty());
    t.advance(Duration::seconds(30));
    delegate.repair();
    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert!(!t.is_running(&pi).await);
    Ok(())
}

#[tokio::test]
async fn test_job_retries_can_be_reset() -> anyhow::Result<()> {
    let t = TestEngine::builder()
        .delegate("charge-card", Arc::new(FlakyDelegate::broken()))
        .build();
    t.engine.deploy(async_payment()).await?;
    let pi = t
        .engine
        .start_process_instance("payment", vars(json!({})))
        .await?;
    let job_id = t.engine.jobs(&pi).await?.remove(0).id;

    t.engine.set_job_retries(&job_id, 7).await?;
    assert_eq!(t.engine.job(&job_id).await?.map(|j| j.retries), Some(7));

    t.engine.delete_job(&job_id).await?;
    assert!(t.engine.job(&job_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_suspension_keeps_timer_due_date_and_retries() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(wait_five_minutes()).await?;
    let pi = t
        .engine
        .start_process_instance("reminder", vars(json!({})))
        .await?;
    let before = t.engine.jobs(&pi).await?.remove(0);

    t.engine.suspend_process_instance(&pi).await?;
    let suspended = t.engine.job(&before.id).await?.expect("suspended job");
    assert_eq!(suspended.state, JobState::Suspended);
    assert_eq!(suspended.suspended_from, Some(JobState::Timer));

    // suspended jobs are invisible to acquisition, however late it is
    t.advance(Duration::hours(1));
    assert!(t.engine.run_due_jobs().await?.is_empty());
    assert!(t.is_running(&pi).await);

    t.engine.activate_process_instance(&pi).await?;
    let restored = t.engine.job(&before.id).await?.expect("reactivated job");
    assert_eq!(restored.state, JobState::Timer);
    assert_eq!(restored.due_date, before.due_date);
    assert_eq!(restored.retries, before.retries);

    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert_eq!(t.open_task_keys(&pi).await, vec!["follow_up"]);

    let types = t.listener.event_types();
    assert!(types.contains(&"process_instance.suspended"));
    assert!(types.contains(&"process_instance.activated"));
    Ok(())
}

fn hourly_report() -> ProcessDefinition {
    ProcessDefinition::new("hourly-report")
        .node(Node::new(
            "tick",
            NodeKind::TimerStartEvent {
                timer: TimerDefinition::Cycle {
                    expression: "R2/PT1H".to_string(),
                    end_date: None,
                },
            },
        ))
        .node(Node::new(
            "review",
            NodeKind::UserTask {
                assignee: Some("ops".to_string()),
                candidate_users: Vec::new(),
                candidate_groups: Vec::new(),
                priority: 50,
            },
        ))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "tick", "review")
        .flow("f2", "review", "end")
}

#[tokio::test]
async fn test_timer_start_event_repeats_until_exhausted() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let definition_id = t.engine.deploy(hourly_report()).await?;
    assert_eq!(definition_id, ProcessDefinitionId::from("hourly-report:1"));
    assert_eq!(t.engine.jobs_in_state(JobState::Timer).await?.len(), 1);

    t.advance(Duration::hours(1));
    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert_eq!(
        t.engine.process_instances(Some(&definition_id)).await?.len(),
        1
    );
    let next = t.engine.jobs_in_state(JobState::Timer).await?;
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].due_date, Some(start_time() + Duration::hours(2)));

    t.advance(Duration::hours(1));
    t.engine.run_due_jobs().await?;
    assert_eq!(
        t.engine.process_instances(Some(&definition_id)).await?.len(),
        2
    );
    assert!(t.engine.jobs_in_state(JobState::Timer).await?.is_empty());
    assert_eq!(t.engine.tasks_for_assignee("ops").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_redeploy_replaces_start_timers() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(hourly_report()).await?;
    let second = t.engine.deploy(hourly_report()).await?;

    let timers = t.engine.jobs_in_state(JobState::Timer).await?;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].process_definition_id.as_ref(), Some(&second));
    Ok(())
}

fn reminder_and_charge() -> ProcessDefinition {
    ProcessDefinition::new("reminder-and-charge")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new("fork", NodeKind::ParallelGateway))
        .node(Node::new(
            "wait",
            NodeKind::IntermediateCatchEvent {
                event: CatchEventDefinition::Timer(TimerDefinition::Duration("PT5M".to_string())),
            },
        ))
        .node(
            Node::new(
                "charge",
                NodeKind::ServiceTask {
                    delegate: "charge-card".to_string(),
                    fields: Default::default(),
                },
            )
            .async_before(),
        )
        .node(Node::new("join", NodeKind::ParallelGateway))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "fork")
        .flow("f2", "fork", "wait")
        .flow("f3", "fork", "charge")
        .flow("f4", "wait", "join")
        .flow("f5", "charge", "join")
        .flow("f6", "join", "end")
}

#[tokio::test]
async fn test_suspension_parks_every_pending_job() -> anyhow::Result<()> {
    let delegate = Arc::new(RecordingDelegate::default());
    let t = TestEngine::builder()
        .delegate("charge-card", delegate.clone())
        .build();
    t.engine.deploy(reminder_and_charge()).await?;
    let pi = t
        .engine
        .start_process_instance("reminder-and-charge", vars(json!({})))
        .await?;

    let mut before = t.engine.jobs(&pi).await?;
    before.sort_by_key(|j| j.handler_type.clone());
    assert_eq!(before.len(), 2);
    assert_eq!(before[0].state, JobState::Executable);
    assert_eq!(before[1].state, JobState::Timer);
    t.engine.set_job_retries(&before[0].id, 5).await?;

    t.engine.suspend_process_instance(&pi).await?;
    assert_eq!(t.store.count(EntityKind::SuspendedJob).await, 2);
    assert_eq!(t.store.count(EntityKind::Job).await, 0);
    assert_eq!(t.store.count(EntityKind::TimerJob).await, 0);
    assert!(t.engine.run_due_jobs().await?.is_empty());
    assert_eq!(delegate.calls().len(), 0);

    t.engine.activate_process_instance(&pi).await?;
    assert_eq!(t.store.count(EntityKind::SuspendedJob).await, 0);
    let async_job = t.engine.job(&before[0].id).await?.expect("async job");
    assert_eq!(async_job.state, JobState::Executable);
    assert_eq!(async_job.retries, 5);
    let timer = t.engine.job(&before[1].id).await?.expect("timer job");
    assert_eq!(timer.state, JobState::Timer);
    assert_eq!(timer.due_date, before[1].due_date);
    assert_eq!(timer.retries, before[1].retries);

    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    t.advance(Duration::minutes(5));
    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert!(!t.is_running(&pi).await);
    Ok(())
}

#[tokio::test]
async fn test_changing_deployment_tenant_moves_jobs_between_executors() -> anyhow::Result<()> {
    let t = TestEngine::builder().acquire_tenant("acme").build();
    let definition_id = t.engine.deploy(hourly_report()).await?;
    t.advance(Duration::hours(1));

    // the shared deployment's timer belongs to no tenant yet
    assert!(t.engine.run_due_jobs().await?.is_empty());

    let changed = t
        .engine
        .change_deployment_tenant(&definition_id, Some("acme".to_string()))
        .await?;
    assert_eq!(changed, 1);
    let timers = t.engine.jobs_in_state(JobState::Timer).await?;
    assert_eq!(timers[0].tenant_id.as_deref(), Some("acme"));

    assert_eq!(t.engine.run_due_jobs().await?, vec![JobOutcome::Succeeded]);
    assert_eq!(
        t.engine.process_instances(Some(&definition_id)).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_advance_runs_async_activity_immediately() -> anyhow::Result<()> {
    let delegate = Arc::new(RecordingDelegate::returning(vars(json!({ "charged": true }))));
    let t = TestEngine::builder()
        .delegate("charge-card", delegate.clone())
        .build();
    t.engine.deploy(async_payment_with_receipt()).await?;
    let pi = t
        .engine
        .start_process_instance("payment-with-receipt", vars(json!({})))
        .await?;
    assert_eq!(t.engine.jobs(&pi).await?.len(), 1);

    t.engine.advance(&pi).await?;
    assert_eq!(delegate.calls().len(), 1);
    assert_eq!(t.open_task_keys(&pi).await, vec!["receipt"]);
    assert_eq!(t.engine.get_variable(&pi, "charged").await?, Some(json!(true)));

    // the continuation was consumed, the delegate does not run twice
    assert!(t.engine.jobs(&pi).await?.is_empty());
    assert!(t.engine.run_due_jobs().await?.is_empty());
    assert_eq!(delegate.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_advance_refuses_suspended_execution() -> anyhow::Result<()> {
    let t = TestEngine::builder()
        .delegate("charge-card", Arc::new(RecordingDelegate::default()))
        .build();
    t.engine.deploy(async_payment_with_receipt()).await?;
    let pi = t
        .engine
        .start_process_instance("payment-with-receipt", vars(json!({})))
        .await?;
    t.engine.suspend_process_instance(&pi).await?;

    let result = t.engine.advance(&pi).await;
    assert!(matches!(result, Err(CoreError::IllegalState(_))));
    assert_eq!(t.engine.jobs(&pi).await?.len(), 1);
    Ok(())
}

fn async_payment_with_receipt() -> ProcessDefinition {
    ProcessDefinition::new("payment-with-receipt")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(
            Node::new(
                "charge",
                NodeKind::ServiceTask {
                    delegate: "charge-card".to_string(),
                    fields: Default::default(),
                },
            )
            .async_before(),
        )
        .node(Node::new(
            "receipt",
            NodeKind::UserTask {
                assignee: None,
                candidate_users: Vec::new(),
                candidate_groups: Vec::new(),
                priority: 50,
            },
        ))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "charge")
        .flow("f2", "charge", "receipt")
        .flow("f3", "receipt", "end")
}

#[tokio::test]
async fn test_background_executor_runs_due_jobs_until_shutdown() -> anyhow::Result<()> {
    let delegate = Arc::new(RecordingDelegate::default());
    let t = TestEngine::builder()
        .poll_interval(StdDuration::from_millis(10))
        .delegate("charge-card", delegate.clone())
        .build();
    t.engine.deploy(async_payment()).await?;
    let pi = t
        .engine
        .start_process_instance("payment", vars(json!({})))
        .await?;

    let handle = t.engine.start_executor();
    tokio::time::timeout(StdDuration::from_secs(5), async {
        while t.is_running(&pi).await {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await?;
    handle.shutdown().await;
    assert_eq!(delegate.calls().len(), 1);

    // nothing polls any more
    let parked = t
        .engine
        .start_process_instance("payment", vars(json!({})))
        .await?;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(t.is_running(&parked).await);
    assert_eq!(t.engine.jobs(&parked).await?.len(), 1);
    assert_eq!(delegate.calls().len(), 1);
    Ok(())
}
