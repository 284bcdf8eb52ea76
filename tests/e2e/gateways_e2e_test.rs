//! Gateway routing end to end: parallel fork/join, exclusive choice and
//! inclusive fork/join on the in-memory store

use conflux_core::{Node, NodeKind, ProcessDefinition};
use conflux_tests::{vars, TestEngine};
use pretty_assertions::assert_eq;
use serde_json::json;

fn user_task(id: &str) -> Node {
    Node::new(
        id,
        NodeKind::UserTask {
            assignee: None,
            candidate_users: Vec::new(),
            candidate_groups: Vec::new(),
            priority: 50,
        },
    )
}

fn parallel_review() -> ProcessDefinition {
    ProcessDefinition::new("parallel-review")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new("fork", NodeKind::ParallelGateway))
        .node(user_task("legal"))
        .node(user_task("finance"))
        .node(Node::new("join", NodeKind::ParallelGateway))
        .node(user_task("archive"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "fork")
        .flow("f2", "fork", "legal")
        .flow("f3", "fork", "finance")
        .flow("f4", "legal", "join")
        .flow("f5", "finance", "join")
        .flow("f6", "join", "archive")
        .flow("f7", "archive", "end")
}

#[tokio::test]
async fn test_parallel_gateway_waits_for_every_branch() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(parallel_review()).await?;
    let pi = t
        .engine
        .start_process_instance("parallel-review", vars(json!({})))
        .await?;

    assert_eq!(t.open_task_keys(&pi).await, vec!["finance", "legal"]);
    // root plus one concurrent child per branch
    assert_eq!(t.engine.executions(&pi).await?.len(), 3);

    t.complete(&pi, "legal", vars(json!({ "legal_ok": true })))
        .await?;
    assert!(t.is_running(&pi).await);
    assert_eq!(t.open_task_keys(&pi).await, vec!["finance"]);
    // the legal branch waits at the join without moving on
    let executions = t.engine.executions(&pi).await?;
    assert_eq!(executions.len(), 3);
    let parked: Vec<_> = executions
        .iter()
        .filter(|e| e.activity_id.as_deref() == Some("join"))
        .collect();
    assert_eq!(parked.len(), 1);
    assert!(!parked[0].is_active);

    t.complete(&pi, "finance", vars(json!({}))).await?;
    // exactly one token continues past the join, on the process instance itself
    let executions = t.engine.executions(&pi).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, pi);
    assert_eq!(executions[0].activity_id.as_deref(), Some("archive"));
    assert_eq!(t.engine.tasks(&pi).await?.len(), 1);

    t.complete(&pi, "archive", vars(json!({}))).await?;
    assert!(!t.is_running(&pi).await);
    assert!(t.engine.executions(&pi).await?.is_empty());

    // one join record per arriving branch
    assert_eq!(
        t.visited(&pi).await,
        vec!["archive", "end", "finance", "fork", "join", "join", "legal", "start"]
    );
    let activities = t.engine.historic_activity_instances(&pi).await?;
    assert!(activities.iter().all(|a| a.end_time.is_some()));

    let instance = t
        .engine
        .historic_process_instance(&pi)
        .await?
        .expect("historic process instance");
    assert_eq!(instance.end_activity_id.as_deref(), Some("end"));
    assert!(instance.delete_reason.is_none());
    Ok(())
}

fn order_routing() -> ProcessDefinition {
    ProcessDefinition::new("order-routing")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new("route", NodeKind::ExclusiveGateway).default_flow("to_auto"))
        .node(user_task("manual_review"))
        .node(Node::new("auto_approve", NodeKind::ManualTask))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "route")
        .conditional_flow("to_manual", "route", "manual_review", "amount > `100`")
        .flow("to_auto", "route", "auto_approve")
        .flow("f2", "manual_review", "end")
        .flow("f3", "auto_approve", "end")
}

#[tokio::test]
async fn test_exclusive_gateway_takes_matching_flow() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(order_routing()).await?;

    let large = t
        .engine
        .start_process_instance("order-routing", vars(json!({ "amount": 250 })))
        .await?;
    assert_eq!(t.open_task_keys(&large).await, vec!["manual_review"]);

    let small = t
        .engine
        .start_process_instance("order-routing", vars(json!({ "amount": 40 })))
        .await?;
    assert!(!t.is_running(&small).await);
    assert!(t.visited(&small).await.contains(&"auto_approve".to_string()));
    assert!(!t.visited(&small).await.contains(&"manual_review".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_exclusive_gateway_without_match_or_default_fails() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let definition = ProcessDefinition::new("strict-routing")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new("route", NodeKind::ExclusiveGateway))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "route")
        .conditional_flow("f2", "route", "end", "approved");
    t.engine.deploy(definition).await?;

    let result = t
        .engine
        .start_process_instance("strict-routing", vars(json!({ "approved": false })))
        .await;
    assert!(result.is_err());
    // nothing of the failed start was committed
    assert!(t.engine.process_instances(None).await?.is_empty());
    Ok(())
}

fn inclusive_checks() -> ProcessDefinition {
    ProcessDefinition::new("inclusive-checks")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new("split", NodeKind::InclusiveGateway))
        .node(user_task("credit_check"))
        .node(user_task("fraud_check"))
        .node(Node::new("merge", NodeKind::InclusiveGateway))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "split")
        .conditional_flow("f2", "split", "credit_check", "credit")
        .conditional_flow("f3", "split", "fraud_check", "fraud")
        .flow("f4", "credit_check", "merge")
        .flow("f5", "fraud_check", "merge")
        .flow("f6", "merge", "end")
}

#[tokio::test]
async fn test_inclusive_gateway_single_branch() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(inclusive_checks()).await?;
    let pi = t
        .engine
        .start_process_instance(
            "inclusive-checks",
            vars(json!({ "credit": true, "fraud": false })),
        )
        .await?;

    assert_eq!(t.open_task_keys(&pi).await, vec!["credit_check"]);
    t.complete(&pi, "credit_check", vars(json!({}))).await?;
    assert!(!t.is_running(&pi).await);
    Ok(())
}

#[tokio::test]
async fn test_inclusive_gateway_joins_only_activated_branches() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(inclusive_checks()).await?;
    let pi = t
        .engine
        .start_process_instance(
            "inclusive-checks",
            vars(json!({ "credit": true, "fraud": true })),
        )
        .await?;

    assert_eq!(t.open_task_keys(&pi).await, vec!["credit_check", "fraud_check"]);
    t.complete(&pi, "fraud_check", vars(json!({}))).await?;
    assert!(t.is_running(&pi).await);

    t.complete(&pi, "credit_check", vars(json!({}))).await?;
    assert!(!t.is_running(&pi).await);
    Ok(())
}
