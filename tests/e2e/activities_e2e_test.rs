//! Script, send and receive tasks end to end, plus direct signalling of
//! waiting executions

use std::sync::Arc;

use conflux_core::{CoreError, Node, NodeKind, ProcessDefinition};
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

fn packing_list() -> ProcessDefinition {
    ProcessDefinition::new("packing-list")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new(
            "bulky_items",
            NodeKind::ScriptTask {
                script: "items[?qty > `1`].sku".to_string(),
                result_variable: Some("bulky".to_string()),
            },
        ))
        .node(Node::new(
            "notify",
            NodeKind::SendTask {
                delegate: "notify-warehouse".to_string(),
                fields: [("channel".to_string(), json!("email"))].into_iter().collect(),
            },
        ))
        .node(user_task("pack"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "bulky_items")
        .flow("f2", "bulky_items", "notify")
        .flow("f3", "notify", "pack")
        .flow("f4", "pack", "end")
}

#[tokio::test]
async fn test_script_result_reaches_send_task() -> anyhow::Result<()> {
    let notify = Arc::new(RecordingDelegate::returning(vars(json!({ "notified": true }))));
    let t = TestEngine::builder()
        .delegate("notify-warehouse", notify.clone())
        .build();
    t.engine.deploy(packing_list()).await?;
    let pi = t
        .engine
        .start_process_instance(
            "packing-list",
            vars(json!({
                "items": [
                    { "sku": "TENT-4", "qty": 2 },
                    { "sku": "STOVE", "qty": 1 },
                    { "sku": "PAD", "qty": 4 }
                ]
            })),
        )
        .await?;

    assert_eq!(
        t.engine.get_variable(&pi, "bulky").await?,
        Some(json!(["TENT-4", "PAD"]))
    );

    let calls = notify.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].activity_id, "notify");
    assert_eq!(calls[0].fields.get("channel"), Some(&json!("email")));
    assert_eq!(calls[0].variables.get("bulky"), Some(&json!(["TENT-4", "PAD"])));
    assert_eq!(t.engine.get_variable(&pi, "notified").await?, Some(json!(true)));
    assert_eq!(t.open_task_keys(&pi).await, vec!["pack"]);

    let types: Vec<_> = t
        .engine
        .historic_activity_instances(&pi)
        .await?
        .into_iter()
        .filter(|a| a.activity_id == "bulky_items" || a.activity_id == "notify")
        .map(|a| a.activity_type)
        .collect();
    assert_eq!(types, vec!["scriptTask", "sendTask"]);
    Ok(())
}

#[tokio::test]
async fn test_script_with_bad_expression_is_rejected_at_deploy() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let result = t
        .engine
        .deploy(
            ProcessDefinition::new("broken-script")
                .node(Node::new("start", NodeKind::NoneStartEvent))
                .node(Node::new(
                    "compute",
                    NodeKind::ScriptTask {
                        script: "items[?".to_string(),
                        result_variable: Some("out".to_string()),
                    },
                ))
                .node(Node::new("end", NodeKind::NoneEndEvent))
                .flow("f1", "start", "compute")
                .flow("f2", "compute", "end"),
        )
        .await;
    assert!(matches!(result, Err(CoreError::ConfigurationError(_))));

    let result = t
        .engine
        .start_process_instance("broken-script", vars(json!({})))
        .await;
    assert!(result.is_err());
    Ok(())
}

fn parcel_tracking() -> ProcessDefinition {
    ProcessDefinition::new("parcel-tracking")
        .node(Node::new("start", NodeKind::NoneStartEvent))
        .node(Node::new(
            "await_pickup",
            NodeKind::ReceiveTask {
                message: "parcel-picked-up".to_string(),
            },
        ))
        .node(user_task("confirm_delivery"))
        .node(Node::new("end", NodeKind::NoneEndEvent))
        .flow("f1", "start", "await_pickup")
        .flow("f2", "await_pickup", "confirm_delivery")
        .flow("f3", "confirm_delivery", "end")
}

#[tokio::test]
async fn test_signal_resumes_waiting_execution() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(parcel_tracking()).await?;
    let pi = t
        .engine
        .start_process_instance("parcel-tracking", vars(json!({})))
        .await?;
    assert_eq!(t.engine.event_subscriptions(&pi).await?.len(), 1);

    t.engine
        .signal(&pi, None, Some(vars(json!({ "courier": "DHL" }))))
        .await?;

    // the message subscription is gone and the payload landed on the instance
    assert!(t.engine.event_subscriptions(&pi).await?.is_empty());
    assert_eq!(t.engine.get_variable(&pi, "courier").await?, Some(json!("DHL")));
    let executions = t.engine.executions(&pi).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(
        executions[0].activity_id.as_deref(),
        Some("confirm_delivery")
    );
    Ok(())
}

#[tokio::test]
async fn test_signal_rejects_suspended_and_unknown_executions() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.engine.deploy(parcel_tracking()).await?;
    let pi = t
        .engine
        .start_process_instance("parcel-tracking", vars(json!({})))
        .await?;

    t.engine.suspend_process_instance(&pi).await?;
    let result = t.engine.signal(&pi, None, None).await;
    assert!(matches!(result, Err(CoreError::IllegalState(_))));
    assert_eq!(t.engine.event_subscriptions(&pi).await?.len(), 1);

    t.engine.activate_process_instance(&pi).await?;
    t.engine.signal(&pi, None, None).await?;
    assert_eq!(t.open_task_keys(&pi).await, vec!["confirm_delivery"]);

    let result = t
        .engine
        .signal(&conflux_core::ExecutionId::from("no-such-execution"), None, None)
        .await;
    assert!(matches!(result, Err(CoreError::ExecutionNotFound(_))));
    Ok(())
}
