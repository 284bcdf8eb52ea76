//! History levels end to end

use conflux_core::domain::entity::EntityKind;
use conflux_core::domain::history::IdentityLinkType;
use conflux_core::{HistoryLevel, Node, NodeKind, ProcessDefinition};
use conflux_tests::{vars, TestEngine};
use pretty_assertions::assert_eq;
use serde_json::json;

fn review() -> ProcessDefinition {
    ProcessDefinition::new("expense-review")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(
            Node::new(
                "review",
                NodeKind::UserTask {
                    assignee: None,
                    candidate_users: vec!["kim".to_string()],
                    candidate_groups: vec!["finance".to_string()],
                    priority: 70,
                },
            )
            .named("Review expense"),
        )
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "review")
        .flow("f2", "review", "end")
}

async fn run_review(t: &TestEngine) -> anyhow::Result<conflux_core::ExecutionId> {
    t.engine.deploy(review()).await?;
    let pi = t
        .engine
        .start_process_instance("expense-review", vars(json!({ "amount": 80 })))
        .await?;
    t.engine.set_variables(&pi, vars(json!({ "amount": 95 }))).await?;
    let task_id = t.task_id(&pi, "review").await;
    t.engine.claim_task(&task_id, "kim").await?;
    t.engine
        .complete_task(&task_id, vars(json!({ "approved": true })))
        .await?;
    Ok(pi)
}

#[tokio::test]
async fn test_full_history_records_everything() -> anyhow::Result<()> {
    let t = TestEngine::builder().history_level(HistoryLevel::Full).build();
    let pi = run_review(&t).await?;
    assert!(!t.is_running(&pi).await);

    let instance = t
        .engine
        .historic_process_instance(&pi)
        .await?
        .expect("historic process instance");
    assert_eq!(instance.start_activity_id.as_deref(), Some("start"));
    assert_eq!(instance.end_activity_id.as_deref(), Some("end"));
    assert_eq!(instance.duration_ms, Some(0));

    assert_eq!(t.visited(&pi).await, vec!["end", "review", "start"]);
    let review = t
        .engine
        .historic_activity_instances(&pi)
        .await?
        .into_iter()
        .find(|a| a.activity_id == "review")
        .expect("review record");
    assert_eq!(review.activity_type, "userTask");
    assert_eq!(review.activity_name.as_deref(), Some("Review expense"));
    assert!(review.task_id.is_some());

    let tasks = t.engine.historic_task_instances(&pi).await?;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].assignee.as_deref(), Some("kim"));
    assert_eq!(tasks[0].priority, 70);
    assert_eq!(tasks[0].delete_reason.as_deref(), Some("completed"));
    assert!(tasks[0].claim_time.is_some());

    let task_id = conflux_core::TaskId::from(tasks[0].id.as_str());
    let links = t.engine.historic_identity_links(&task_id).await?;
    let candidates = links
        .iter()
        .filter(|l| l.link_type == IdentityLinkType::Candidate)
        .count();
    let assignees: Vec<_> = links
        .iter()
        .filter(|l| l.link_type == IdentityLinkType::Assignee)
        .filter_map(|l| l.user_id.clone())
        .collect();
    assert_eq!(candidates, 2);
    assert_eq!(assignees, vec!["kim".to_string()]);

    let variables = t.engine.historic_variable_instances(&pi).await?;
    let amount = variables
        .iter()
        .find(|v| v.name == "amount")
        .expect("amount history");
    assert_eq!(amount.value, json!(95));
    assert!(variables.iter().any(|v| v.name == "approved"));

    let amount_trail: Vec<_> = t
        .engine
        .historic_details(&pi)
        .await?
        .into_iter()
        .filter(|d| d.name == "amount")
        .map(|d| d.value)
        .collect();
    assert_eq!(amount_trail, vec![json!(80), json!(95)]);
    Ok(())
}

#[tokio::test]
async fn test_activity_level_skips_tasks_and_details() -> anyhow::Result<()> {
    let t = TestEngine::builder()
        .history_level(HistoryLevel::Activity)
        .build();
    let pi = run_review(&t).await?;

    assert!(t.engine.historic_process_instance(&pi).await?.is_some());
    assert_eq!(t.visited(&pi).await, vec!["end", "review", "start"]);
    assert!(!t.engine.historic_variable_instances(&pi).await?.is_empty());
    assert!(t.engine.historic_task_instances(&pi).await?.is_empty());
    assert!(t.engine.historic_details(&pi).await?.is_empty());
    assert_eq!(t.store.count(EntityKind::HistoricTaskInstance).await, 0);
    assert_eq!(t.store.count(EntityKind::HistoricDetail).await, 0);
    Ok(())
}

#[tokio::test]
async fn test_no_history_writes_nothing() -> anyhow::Result<()> {
    let t = TestEngine::builder().history_level(HistoryLevel::None).build();
    let pi = run_review(&t).await?;
    assert!(!t.is_running(&pi).await);

    assert!(t.engine.historic_process_instance(&pi).await?.is_none());
    assert!(t.engine.historic_activity_instances(&pi).await?.is_empty());
    for kind in [
        EntityKind::HistoricProcessInstance,
        EntityKind::HistoricActivityInstance,
        EntityKind::HistoricTaskInstance,
        EntityKind::HistoricVariableInstance,
        EntityKind::HistoricDetail,
        EntityKind::HistoricIdentityLink,
    ] {
        assert_eq!(t.store.count(kind).await, 0, "{} rows written", kind);
    }

    // runtime behaviour is unaffected
    let types = t.listener.event_types();
    assert!(types.contains(&"task.completed"));
    assert!(types.contains(&"process_instance.completed"));
    Ok(())
}
