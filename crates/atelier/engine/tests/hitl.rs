//! Human approval gate, plan override, stop/cancel and the polling fallback

use async_trait::async_trait;
use atelier_engine::{
    AdvanceOutcome, EngineConfig, EventBroadcaster, InMemoryRunStore, NullChannel, Orchestrator,
    PlannerBackend, RunManager, Subscription,
};
use atelier_types::{
    EventType, GuardrailCode, Plan, Step, WorkflowContext, WorkflowError, WorkflowResult,
    WorkflowState,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Always proposes one 60-item batch priced at $0.75
struct LargeBatchPlanner;

#[async_trait]
impl PlannerBackend for LargeBatchPlanner {
    async fn plan(&self, _ctx: &WorkflowContext) -> WorkflowResult<Plan> {
        Ok(Plan::new(vec![Step::new("s1", "batch_generate")
            .with_param("prompt", "shoe on marble")
            .with_param("count", 60)])
        .with_cost(0.75))
    }

    fn name(&self) -> &str {
        "large-batch"
    }
}

fn manager() -> RunManager {
    let orchestrator = Orchestrator::builder(EngineConfig::default())
        .planner(Arc::new(LargeBatchPlanner))
        .build();
    RunManager::new(
        Arc::new(orchestrator),
        Arc::new(InMemoryRunStore::new()),
        Duration::from_millis(10),
    )
}

fn count(manager: &RunManager, run_id: &atelier_types::RunId, event_type: EventType) -> usize {
    manager
        .orchestrator()
        .events()
        .history(Some(run_id))
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

#[tokio::test]
async fn test_large_batch_waits_for_approval() {
    let manager = manager();
    let run_id = manager
        .submit(json!({"intent": "batch_variations"}), Map::new())
        .await;

    let outcome = manager.run_until_settled(&run_id, false).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::AwaitingApproval);

    let parked = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(parked.state, WorkflowState::Proposed);
    assert!(parked.result.is_none());
    let plan = parked.plan.clone().unwrap();
    assert_eq!(plan.estimated_cost_usd, 0.75);
    assert!(plan.requires_hitl);
    let critique = parked.critique.clone().unwrap();
    assert!(critique.ok);
    assert!(critique.requires_hitl);
    assert!(critique
        .issues
        .iter()
        .any(|i| i.code == GuardrailCode::ApprovalRequired));

    // The reviewer sees the triggering issues on the blocked event
    let blocked = manager
        .orchestrator()
        .events()
        .history(Some(&run_id))
        .into_iter()
        .find(|e| e.event_type == EventType::Blocked)
        .unwrap();
    assert_eq!(blocked.payload["requires_hitl"], true);
    assert!(!blocked.payload["issues"].as_array().unwrap().is_empty());

    for _ in 0..5 {
        assert_eq!(
            manager.advance(&run_id, false).await.unwrap(),
            AdvanceOutcome::AwaitingApproval
        );
    }
    let still = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(still.state, WorkflowState::Proposed);
    assert_eq!(still.updated_at, parked.updated_at);
    assert_eq!(count(&manager, &run_id, EventType::Blocked), 1);

    assert_eq!(
        manager.advance(&run_id, true).await.unwrap(),
        AdvanceOutcome::Transitioned {
            from: WorkflowState::Proposed,
            to: WorkflowState::Approved
        }
    );
    manager.run_until_settled(&run_id, false).await.unwrap();

    let done = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(done.state, WorkflowState::Completed);
    let result = done.result.unwrap();
    assert!(result.success);
    assert_eq!(result.total_cost_usd, 0.75);
    assert_eq!(count(&manager, &run_id, EventType::Approved), 1);
    assert_eq!(count(&manager, &run_id, EventType::WorkflowComplete), 1);
}

#[tokio::test]
async fn test_approval_with_override_plan() {
    let manager = manager();
    let run_id = manager
        .submit(json!({"intent": "batch_variations"}), Map::new())
        .await;
    manager.run_until_settled(&run_id, false).await.unwrap();
    let original_seed = manager
        .snapshot(&run_id)
        .await
        .unwrap()
        .plan
        .unwrap()
        .determinism
        .seed;

    let smaller = Plan::new(vec![Step::new("s1", "batch_generate")
        .with_param("prompt", "shoe on marble")
        .with_param("count", 20)]);
    let outcome = manager.approve(&run_id, Some(smaller)).await.unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Transitioned {
            from: WorkflowState::Proposed,
            to: WorkflowState::Approved
        }
    );
    manager.run_until_settled(&run_id, false).await.unwrap();

    let snapshot = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Completed);
    let plan = snapshot.plan.unwrap();
    assert_eq!(plan.metadata["override"], Value::Bool(true));
    assert_eq!(plan.estimated_cost_usd, 0.25);
    assert_eq!(plan.determinism.seed, original_seed);
    assert_eq!(snapshot.result.unwrap().total_cost_usd, 0.25);

    assert_eq!(
        manager.approve(&run_id, None).await.unwrap(),
        AdvanceOutcome::Terminal {
            state: WorkflowState::Completed
        }
    );
}

#[tokio::test]
async fn test_rejected_override_keeps_run_waiting() {
    let manager = manager();
    let run_id = manager
        .submit(json!({"intent": "batch_variations"}), Map::new())
        .await;
    manager.run_until_settled(&run_id, false).await.unwrap();
    let before = manager.snapshot(&run_id).await.unwrap();

    let unsafe_plan = Plan::new(vec![Step::new("s1", "format_disk")]);
    let err = manager
        .approve(&run_id, Some(unsafe_plan))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::OverrideRejected(ref g) if g.code == GuardrailCode::OpNotAllowed
    ));

    let after = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(after.state, WorkflowState::Proposed);
    assert_eq!(after.plan, before.plan);
}

#[tokio::test]
async fn test_stop_parked_run() {
    let manager = manager();
    let run_id = manager
        .submit(json!({"intent": "batch_variations"}), Map::new())
        .await;
    manager.run_until_settled(&run_id, false).await.unwrap();

    assert!(manager.stop(&run_id).await.unwrap());
    let snapshot = manager.snapshot(&run_id).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Stopped);
    assert!(snapshot.result.is_none());
    assert_eq!(count(&manager, &run_id, EventType::Stopped), 1);

    assert_eq!(
        manager.advance(&run_id, true).await.unwrap(),
        AdvanceOutcome::Terminal {
            state: WorkflowState::Stopped
        }
    );
    assert!(manager.cancel(&run_id).await.is_err());
}

#[tokio::test]
async fn test_polling_fallback_reports_state_changes() {
    let events = Arc::new(EventBroadcaster::new(Arc::new(NullChannel), 100));
    let orchestrator = Orchestrator::builder(EngineConfig::default())
        .events(events)
        .build();
    let manager = RunManager::new(
        Arc::new(orchestrator),
        Arc::new(InMemoryRunStore::new()),
        Duration::from_millis(10),
    );
    let run_id = manager
        .submit(json!({"intent": "edit_product_shot"}), Map::new())
        .await;

    let mut subscription = manager.subscribe(&run_id);
    assert!(!subscription.is_live());
    assert!(matches!(subscription, Subscription::Polling(_)));

    let created = subscription.next().await.unwrap();
    assert_eq!(created.event_type, EventType::StateChanged);
    assert_eq!(created.payload["from"], Value::Null);
    assert_eq!(created.payload["to"], "CREATED");

    manager.advance(&run_id, false).await.unwrap();
    let planned = subscription.next().await.unwrap();
    assert_eq!(planned.payload["from"], "CREATED");
    assert_eq!(planned.payload["to"], "PLANNED");
    assert!(planned.payload["snapshot"]["plan"].is_object());

    manager.run_until_settled(&run_id, false).await.unwrap();
    let completed = subscription.next().await.unwrap();
    assert_eq!(completed.payload["from"], "PLANNED");
    assert_eq!(completed.payload["to"], "COMPLETED");
    assert!(subscription.next().await.is_none());

    // Publication failures never reach the run
    let stats = manager.orchestrator().events().stats();
    assert!(stats.failed > 0);
}
