//! Scopes end to end: embedded sub-processes, call activities,
//! multi-instance loops, variable scoping, tasks and tenants

use std::sync::Arc;

use conflux_core::{
    CoreError, ExecutionId, MultiInstanceConfig, Node, NodeKind, ProcessDefinition,
    ProcessDefinitionId,
};
use conflux_tests::{vars, RecordingDelegate, TestEngine};
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

fn service_task(id: &str, delegate: &str) -> Node {
    Node::new(
        id,
        NodeKind::ServiceTask {
            delegate: delegate.to_string(),
            fields: Default::default(),
        },
    )
}

// ---- call activities ----

fn payment_process() -> ProcessDefinition {
    ProcessDefinition::new("collect-payment")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(user_task("pay"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "pay")
        .flow("f2", "pay", "end")
}

fn order_process() -> ProcessDefinition {
    ProcessDefinition::new("order")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new(
            "payment",
            NodeKind::CallActivity {
                called_element: "collect-payment".to_string(),
                in_variables: vec!["amount".to_string()],
                out_variables: vec!["receipt".to_string()],
            },
        ))
        .node(user_task("confirm"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "payment")
        .flow("f2", "payment", "confirm")
        .flow("f3", "confirm", "end")
}

#[tokio::test]
async fn test_call_activity_passes_variables_both_ways() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let payment_id = t.engine.deploy(payment_process()).await?;
    t.engine.deploy(order_process()).await?;

    let order = t
        .engine
        .start_process_instance("order", vars(json!({ "amount": 120, "customer": "c-1" })))
        .await?;

    let called = t.engine.process_instances(Some(&payment_id)).await?;
    assert_eq!(called.len(), 1);
    let payment = called[0].id.clone();
    assert!(called[0].super_execution_id.is_some());

    // only the declared input crosses over
    let inner = t.engine.get_variables(&payment).await?;
    assert_eq!(inner.get("amount"), Some(&json!(120)));
    assert!(!inner.contains_key("customer"));

    t.complete(&payment, "pay", vars(json!({ "receipt": "R-77", "card": "visa" })))
        .await?;
    assert!(!t.is_running(&payment).await);
    assert_eq!(t.open_task_keys(&order).await, vec!["confirm"]);
    assert_eq!(
        t.engine.get_variable(&order, "receipt").await?,
        Some(json!("R-77"))
    );
    assert_eq!(t.engine.get_variable(&order, "card").await?, None);

    let call = t
        .engine
        .historic_activity_instances(&order)
        .await?
        .into_iter()
        .find(|a| a.activity_id == "payment")
        .expect("call activity record");
    assert_eq!(call.called_process_instance_id, Some(payment.clone()));
    let sub = t
        .engine
        .historic_process_instance(&payment)
        .await?
        .expect("called instance history");
    assert_eq!(sub.super_process_instance_id, Some(order.clone()));
    Ok(())
}

#[tokio::test]
async fn test_deleting_caller_removes_called_instance() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let payment_id = t.engine.deploy(payment_process()).await?;
    t.engine.deploy(order_process()).await?;
    let order = t
        .engine
        .start_process_instance("order", vars(json!({ "amount": 5 })))
        .await?;

    t.engine.delete_process_instance(&order, "abandoned").await?;
    assert!(t.engine.process_instances(Some(&payment_id)).await?.is_empty());
    assert!(t.engine.process_instances(None).await?.is_empty());
    Ok(())
}

// ---- embedded sub-process ----

#[tokio::test]
async fn test_embedded_sub_process_scopes_local_variables() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine
        .deploy(
            ProcessDefinition::new("onboarding")
                .node(Node::new("start", NodeKind::NoneStartEvent))
                .node(Node::new("paperwork", NodeKind::SubProcess))
                .node(Node::new("paperwork_start", NodeKind::NoneStartEvent).in_sub_process("paperwork"))
                .node(user_task("sign_contract").in_sub_process("paperwork"))
                .node(Node::new("paperwork_end", NodeKind::NoneEndEvent).in_sub_process("paperwork"))
                .node(user_task("welcome"))
                .node(Node::new("end", NodeKind::NoneEndEvent))
                .flow("f1", "start", "paperwork")
                .flow("p1", "paperwork_start", "sign_contract")
                .flow("p2", "sign_contract", "paperwork_end")
                .flow("f2", "paperwork", "welcome")
                .flow("f3", "welcome", "end"),
        )
        .await?;
    let pi = t
        .engine
        .start_process_instance("onboarding", vars(json!({ "employee": "ada" })))
        .await?;

    let task = t.engine.task(&t.task_id(&pi, "sign_contract").await).await?.expect("task");
    let scope = task.execution_id.clone();
    assert_ne!(scope, pi);

    t.engine
        .set_variable_local(&scope, "draft", json!("v1"))
        .await?;
    t.engine
        .set_variables(&scope, vars(json!({ "employee": "ada lovelace", "desk": 12 })))
        .await?;
    assert_eq!(t.engine.get_variable(&scope, "draft").await?, Some(json!("v1")));
    assert_eq!(t.engine.get_variable(&pi, "draft").await?, None);
    // existing names are updated where they live, new ones land on the instance
    assert_eq!(
        t.engine.get_variable(&pi, "employee").await?,
        Some(json!("ada lovelace"))
    );
    assert_eq!(t.engine.get_variable(&pi, "desk").await?, Some(json!(12)));

    t.complete(&pi, "sign_contract", vars(json!({}))).await?;
    assert_eq!(t.open_task_keys(&pi).await, vec!["welcome"]);
    assert_eq!(t.engine.executions(&pi).await?.len(), 1);
    Ok(())
}

// ---- multi-instance ----

#[tokio::test]
async fn test_sequential_multi_instance_visits_collection_in_order() -> anyhow::Result<()> {
    let notify = Arc::new(RecordingDelegate::default());
    let t = TestEngine::builder().delegate("notify", notify.clone()).build();
    t.engine
        .deploy(
            ProcessDefinition::new("notify-all")
                .node(Node::new("start", NodeKind::NoneStartEvent))
                .node(service_task("notify", "notify").multi_instance(MultiInstanceConfig {
                    sequential: true,
                    cardinality: None,
                    collection: Some("recipients".to_string()),
                    element_variable: Some("recipient".to_string()),
                    completion_condition: None,
                }))
                .node(user_task("wrap_up"))
                .node(Node::new("end", NodeKind::NoneEndEvent))
                .flow("f1", "start", "notify")
                .flow("f2", "notify", "wrap_up")
                .flow("f3", "wrap_up", "end"),
        )
        .await?;

    let pi = t
        .engine
        .start_process_instance(
            "notify-all",
            vars(json!({ "recipients": ["ann", "bob", "cy"] })),
        )
        .await?;

    let seen: Vec<_> = notify
        .calls()
        .into_iter()
        .map(|c| (c.variables["recipient"].clone(), c.variables["loopCounter"].clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (json!("ann"), json!(0)),
            (json!("bob"), json!(1)),
            (json!("cy"), json!(2)),
        ]
    );
    assert_eq!(t.open_task_keys(&pi).await, vec!["wrap_up"]);
    // loop counters lived on the loop's own scope
    assert_eq!(t.engine.get_variable(&pi, "loopCounter").await?, None);

    let iterations = t
        .engine
        .historic_activity_instances(&pi)
        .await?
        .into_iter()
        .filter(|a| a.activity_id == "notify")
        .count();
    assert_eq!(iterations, 3);
    Ok(())
}

#[tokio::test]
async fn test_empty_collection_skips_multi_instance() -> anyhow::Result<()> {
    let notify = Arc::new(RecordingDelegate::default());
    let t = TestEngine::builder().delegate("notify", notify.clone()).build();
    t.engine
        .deploy(
            ProcessDefinition::new("notify-none")
                .node(Node::new("start", NodeKind::NoneStartEvent))
                .node(service_task("notify", "notify").multi_instance(MultiInstanceConfig {
                    sequential: false,
                    cardinality: None,
                    collection: Some("recipients".to_string()),
                    element_variable: Some("recipient".to_string()),
                    completion_condition: None,
                }))
                .node(Node::new("end", NodeKind::NoneEndEvent))
                .flow("f1", "start", "notify")
                .flow("f2", "notify", "end"),
        )
        .await?;

    let pi = t
        .engine
        .start_process_instance("notify-none", vars(json!({ "recipients": [] })))
        .await?;
    assert!(notify.calls().is_empty());
    assert!(!t.is_running(&pi).await);
    Ok(())
}

fn parallel_votes(completion_condition: Option<&str>) -> ProcessDefinition {
    ProcessDefinition::new("votes")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(user_task("vote").multi_instance(MultiInstanceConfig {
            sequential: false,
            cardinality: Some(3),
            collection: None,
            element_variable: None,
            completion_condition: completion_condition.map(str::to_string),
        }))
        .node(user_task("tally"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "vote")
        .flow("f2", "vote", "tally")
        .flow("f3", "tally", "end")
}

#[tokio::test]
async fn test_parallel_multi_instance_waits_for_all_instances() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(parallel_votes(None)).await?;
    let pi = t
        .engine
        .start_process_instance("votes", vars(json!({})))
        .await?;

    let tasks = t.engine.tasks(&pi).await?;
    assert_eq!(tasks.len(), 3);
    let counters: Vec<_> = {
        let mut found = Vec::new();
        for task in &tasks {
            found.push(t.engine.get_variable(&task.execution_id, "loopCounter").await?);
        }
        found.sort_by_key(|v| v.as_ref().and_then(|v| v.as_u64()));
        found
    };
    assert_eq!(counters, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
    assert_eq!(
        t.engine
            .get_variable(&tasks[0].execution_id, "nrOfInstances")
            .await?,
        Some(json!(3))
    );

    for task in &tasks[..2] {
        t.engine.complete_task(&task.id, vars(json!({}))).await?;
    }
    assert_eq!(t.open_task_keys(&pi).await, vec!["vote"]);

    t.engine.complete_task(&tasks[2].id, vars(json!({}))).await?;
    assert_eq!(t.open_task_keys(&pi).await, vec!["tally"]);
    assert_eq!(t.engine.executions(&pi).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_parallel_multi_instance_completion_condition() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine
        .deploy(parallel_votes(Some("nrOfCompletedInstances >= `2`")))
        .await?;
    let pi = t
        .engine
        .start_process_instance("votes", vars(json!({})))
        .await?;

    let tasks = t.engine.tasks(&pi).await?;
    t.engine.complete_task(&tasks[0].id, vars(json!({}))).await?;
    assert_eq!(t.engine.tasks(&pi).await?.len(), 2);

    t.engine.complete_task(&tasks[1].id, vars(json!({}))).await?;
    assert_eq!(t.open_task_keys(&pi).await, vec!["tally"]);
    assert!(t.engine.task(&tasks[2].id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_parallel_multi_instance_rejects_negative_counter() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(parallel_votes(None)).await?;
    let pi = t
        .engine
        .start_process_instance("votes", vars(json!({})))
        .await?;

    let tasks = t.engine.tasks(&pi).await?;
    let child = t
        .engine
        .executions(&pi)
        .await?
        .into_iter()
        .find(|e| e.id == tasks[0].execution_id)
        .expect("task execution");
    let root = child.parent_id.expect("multi-instance root");
    t.engine
        .set_variable_local(&root, "nrOfCompletedInstances", json!(-1))
        .await?;

    let result = t.engine.complete_task(&tasks[0].id, vars(json!({}))).await;
    assert!(matches!(result, Err(CoreError::BehaviorError(_))));
    // the failed completion was rolled back
    assert_eq!(t.engine.tasks(&pi).await?.len(), 3);
    Ok(())
}

// ---- tasks ----

#[tokio::test]
async fn test_claim_and_complete_task() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(payment_process()).await?;
    let pi = t
        .engine
        .start_process_instance("collect-payment", vars(json!({})))
        .await?;
    let task_id = t.task_id(&pi, "pay").await;

    t.engine.claim_task(&task_id, "kim").await?;
    t.engine.claim_task(&task_id, "kim").await?;
    let err = t.engine.claim_task(&task_id, "lee").await.unwrap_err();
    assert!(matches!(err, CoreError::IllegalState(_)));
    assert_eq!(t.engine.tasks_for_assignee("kim").await?.len(), 1);

    t.engine.suspend_process_instance(&pi).await?;
    let err = t
        .engine
        .complete_task(&task_id, vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IllegalState(_)));

    t.engine.activate_process_instance(&pi).await?;
    t.engine
        .complete_task(&task_id, vars(json!({ "paid": true })))
        .await?;
    assert!(!t.is_running(&pi).await);

    let err = t
        .engine
        .complete_task(&task_id, vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TaskNotFound(_)));
    Ok(())
}

// ---- deployment and tenants ----

#[tokio::test]
async fn test_start_uses_latest_version_and_tenant() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let v1 = t.engine.deploy(payment_process()).await?;
    let v2 = t.engine.deploy(payment_process()).await?;
    let acme = t
        .engine
        .deploy(payment_process().with_tenant("acme"))
        .await?;
    assert_eq!(v1, ProcessDefinitionId::from("collect-payment:1"));
    assert_eq!(v2, ProcessDefinitionId::from("collect-payment:2"));
    assert_eq!(acme, ProcessDefinitionId::from("acme:collect-payment:1"));

    let shared = t
        .engine
        .start_process_instance("collect-payment", vars(json!({})))
        .await?;
    let own = t
        .engine
        .start_process_instance_for_tenant(
            "collect-payment",
            Some("acme"),
            Some("invoice-9".to_string()),
            vars(json!({})),
        )
        .await?;
    let fallback = t
        .engine
        .start_process_instance_for_tenant("collect-payment", Some("globex"), None, vars(json!({})))
        .await?;
    let pinned = t
        .engine
        .start_process_instance_by_id(&v1, None, vars(json!({})))
        .await?;

    let definition_of = |id: ExecutionId| {
        let engine = &t.engine;
        async move {
            engine
                .process_instance(&id)
                .await
                .unwrap()
                .map(|pi| (pi.process_definition_id, pi.tenant_id, pi.business_key))
        }
    };
    assert_eq!(definition_of(shared).await, Some((v2.clone(), None, None)));
    assert_eq!(
        definition_of(own).await,
        Some((acme, Some("acme".to_string()), Some("invoice-9".to_string())))
    );
    assert_eq!(definition_of(fallback).await, Some((v2, None, None)));
    assert_eq!(definition_of(pinned).await, Some((v1, None, None)));

    let err = t
        .engine
        .start_process_instance("missing", vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ProcessDefinitionNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_deploy_rejects_unregistered_delegate() {
    let t = TestEngine::new();
    let err = t
        .engine
        .deploy(
            ProcessDefinition::new("needs-delegate")
                .node(Node::new("start", NodeKind::NoneStartEvent))
                .node(service_task("call", "not-registered"))
                .flow("f1", "start", "call"),
        )
        .await
        .unwrap_err();
    assert!(err.is_configuration_error());
}
