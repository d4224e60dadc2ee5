//! End-to-end execution behavior: branching, delays, dedup, rate limits, and
//! failure handling.

mod common;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::*;
use pulseflow::workflow::types::{AnalyticsRange, ExecutionStatus, StepStatus, WorkflowStatus};
use pulseflow::EngineError;
use serde_json::Value;

async fn wait_for_execution_status(h: &TestHarness, execution_id: &str, status: ExecutionStatus) {
    let reached = wait_until(|| async {
        h.service
            .store()
            .get_execution(execution_id)
            .await
            .unwrap()
            .is_some_and(|e| e.status == status)
    })
    .await;
    assert!(reached, "execution never reached {status:?}");
}

async fn wait_for_step_status(h: &TestHarness, execution_id: &str, step_id: &str, status: StepStatus) {
    let reached = wait_until(|| async {
        h.service
            .store()
            .get_step(execution_id, step_id)
            .await
            .unwrap()
            .is_some_and(|s| s.status == status)
    })
    .await;
    assert!(reached, "step {step_id} never reached {status:?}");
}

#[tokio::test]
async fn branching_execution_takes_the_yes_path() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&branching_spec("u1")).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", serde_json::json!({"source": "signup"}))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.complexity, 5.5);

    wait_for_execution_status(&h, &execution.id, ExecutionStatus::Completed).await;

    let steps = h.service.store().list_steps(&execution.id).await.unwrap();
    let status_of = |id: &str| steps.iter().find(|s| s.step_id == id).unwrap().status;
    assert_eq!(status_of("t1"), StepStatus::Completed);
    assert_eq!(status_of("c1"), StepStatus::Completed);
    assert_eq!(status_of("m_pro"), StepStatus::Completed);
    assert_eq!(status_of("m_free"), StepStatus::Pending, "NO branch untaken");

    let sent = h.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject.as_deref(), Some("Hi Ada"));
    assert_eq!(sent[0].recipient, "c1@example.com");

    // Every step output landed in the persisted context document
    let (document, version) = h
        .service
        .store()
        .load_context(&execution.id)
        .await
        .unwrap()
        .unwrap();
    assert!(version >= 3, "one CAS write per executed step");
    assert_eq!(document["step_outputs"]["c1"]["condition_met"], Value::Bool(true));
    assert!(document["step_outputs"]["m_pro"]["tracking_id"]
        .as_str()
        .is_some_and(|t| t.starts_with("msg-")));
    assert_eq!(document["variables"]["source"], Value::String("signup".into()));
}

#[tokio::test]
async fn free_plan_contact_takes_the_no_path() {
    let h = harness().await;
    h.directory.add_contact(contact("c2", "free")).await;
    let workflow = h.service.workflows().create(&branching_spec("u1")).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c2", Value::Null)
        .await
        .unwrap();
    wait_for_execution_status(&h, &execution.id, ExecutionStatus::Completed).await;

    let sent = h.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "Upgrade today, Ada!");
}

#[tokio::test]
async fn delay_parks_the_step_with_an_absolute_fire_time() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&delayed_spec("u1")).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();

    wait_for_step_status(&h, &execution.id, "d1", StepStatus::Scheduled).await;

    let step = h
        .service
        .store()
        .get_step(&execution.id, "d1")
        .await
        .unwrap()
        .unwrap();
    let fire_at: DateTime<Utc> = step.scheduled_for.unwrap().parse().unwrap();
    let expected = Utc::now() + ChronoDuration::hours(2);
    assert!((fire_at - expected).num_seconds().abs() < 60);

    // Execution stays open while the branch is parked
    let execution = h
        .service
        .store()
        .get_execution(&execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(h.sender.sent().await.is_empty());
}

#[tokio::test]
async fn resumed_delay_continues_downstream() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&delayed_spec("u1")).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    wait_for_step_status(&h, &execution.id, "d1", StepStatus::Scheduled).await;

    // Fire the continuation directly instead of sleeping out the delay
    h.service
        .engine()
        .execute_step(&execution.id, "d1")
        .await
        .unwrap();

    wait_for_execution_status(&h, &execution.id, ExecutionStatus::Completed).await;

    let (document, _) = h
        .service
        .store()
        .load_context(&execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        document["step_outputs"]["d1"]["delay_completed"],
        Value::Bool(true)
    );
    assert_eq!(h.sender.sent().await.len(), 1);
}

#[tokio::test]
async fn long_delay_splits_the_run_into_done_parked_and_pending() {
    use pulseflow::workflow::types::{ConditionType, NodeType, WorkflowSpec};
    use serde_json::json;

    // trigger -> message -> delay(1 day) -> engagement condition -> message
    let spec = WorkflowSpec {
        name: "re-engagement".to_string(),
        description: None,
        status: WorkflowStatus::Active,
        user_id: "u1".to_string(),
        nodes: vec![
            node("t1", NodeType::Trigger, json!({})),
            node("m1", NodeType::MessageSend, json!({"body": "Welcome!"})),
            node("d1", NodeType::Delay, json!({"amount": 1, "unit": "days"})),
            node(
                "c1",
                NodeType::Condition,
                json!({
                    "condition_type": "contact_property",
                    "property": "engaged",
                    "operator": "equals",
                    "value": true,
                }),
            ),
            node("m2", NodeType::MessageSend, json!({"body": "Still engaged!"})),
        ],
        connections: vec![
            connect("e1", "t1", "m1", ConditionType::Always),
            connect("e2", "m1", "d1", ConditionType::Always),
            connect("e3", "d1", "c1", ConditionType::Always),
            connect("e4", "c1", "m2", ConditionType::Yes),
        ],
        triggers: vec![trigger("tr1", "t1")],
    };

    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&spec).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();

    wait_for_step_status(&h, &execution.id, "d1", StepStatus::Scheduled).await;

    let steps = h.service.store().list_steps(&execution.id).await.unwrap();
    assert_eq!(steps.len(), 5);
    let status_of = |id: &str| steps.iter().find(|s| s.step_id == id).unwrap().status;
    assert_eq!(status_of("t1"), StepStatus::Completed);
    assert_eq!(status_of("m1"), StepStatus::Completed);
    assert_eq!(status_of("d1"), StepStatus::Scheduled);
    assert_eq!(status_of("c1"), StepStatus::Pending);
    assert_eq!(status_of("m2"), StepStatus::Pending);

    assert_eq!(h.sender.sent().await.len(), 1, "only the first message went out");
}

#[tokio::test]
async fn duplicate_start_returns_the_open_execution() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&delayed_spec("u1")).await.unwrap();

    let first = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    wait_for_step_status(&h, &first.id, "d1", StepStatus::Scheduled).await;

    let second = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);

    // The duplicate start neither re-fired the trigger nor duplicated steps
    let definition = h
        .service
        .store()
        .get_definition(&workflow.id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(definition.triggers[0].fire_count, 1);
    assert_eq!(h.service.store().list_steps(&first.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_starts_share_one_execution() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&delayed_spec("u1")).await.unwrap();

    // Both starts race past the dedup read; the unique index on non-terminal
    // (workflow, contact) executions lets only one row land
    let (first, second) = tokio::join!(
        h.service
            .engine()
            .start_execution(&workflow.id, "c1", Value::Null),
        h.service
            .engine()
            .start_execution(&workflow.id, "c1", Value::Null),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.id, second.id, "both starts must observe one execution");

    let open: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM executions \
         WHERE workflow_id = ? AND contact_id = ? AND status IN ('pending', 'running')",
    )
    .bind(&workflow.id)
    .bind("c1")
    .fetch_one(h.service.store().pool())
    .await
    .unwrap();
    assert_eq!(open.0, 1);
}

#[tokio::test]
async fn rate_limited_duplicate_still_returns_the_open_execution() {
    let mut config = test_config();
    config.rate_limits.contact_starts_per_hour = 1;
    let h = harness_with_config(config).await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&delayed_spec("u1")).await.unwrap();

    let first = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    wait_for_step_status(&h, &first.id, "d1", StepStatus::Scheduled).await;

    // The allowance is spent, but dedup resolves before the limiter runs
    let second = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
}

#[tokio::test]
async fn contact_start_limiter_rejects_without_side_effects() {
    let mut config = test_config();
    config.rate_limits.contact_starts_per_hour = 1;
    let h = harness_with_config(config).await;
    h.directory.add_contact(contact("c1", "pro")).await;

    let first_wf = h.service.workflows().create(&branching_spec("u1")).await.unwrap();
    let mut other = branching_spec("u1");
    other.name = "second".to_string();
    let second_wf = h.service.workflows().create(&other).await.unwrap();

    h.service
        .engine()
        .start_execution(&first_wf.id, "c1", Value::Null)
        .await
        .unwrap();

    let rejected = h
        .service
        .engine()
        .start_execution(&second_wf.id, "c1", Value::Null)
        .await;
    assert!(matches!(
        rejected,
        Err(EngineError::RateLimitExceeded { ref limiter }) if limiter == "wf_start:contact:c1"
    ));

    // No execution row was created for the rejected start
    assert!(h
        .service
        .store()
        .find_active_execution(&second_wf.id, "c1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn provider_failure_fails_step_and_execution() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&branching_spec("u1")).await.unwrap();

    h.sender.fail_next();
    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();

    wait_for_execution_status(&h, &execution.id, ExecutionStatus::Failed).await;

    let step = h
        .service
        .store()
        .get_step(&execution.id, "m_pro")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step
        .error_message
        .is_some_and(|m| m.contains("provider rejected")));
}

#[tokio::test]
async fn inactive_workflow_cannot_start() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;

    let mut spec = branching_spec("u1");
    spec.status = WorkflowStatus::Draft;
    let workflow = h.service.workflows().create(&spec).await.unwrap();

    let result = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidWorkflow(_))));
}

#[tokio::test]
async fn missing_contact_rejected_before_any_state() {
    let h = harness().await;
    let workflow = h.service.workflows().create(&branching_spec("u1")).await.unwrap();

    let result = h
        .service
        .engine()
        .start_execution(&workflow.id, "ghost", Value::Null)
        .await;
    assert!(matches!(result, Err(EngineError::ContactNotFound(_))));
}

#[tokio::test]
async fn analytics_reflect_completed_runs_and_update_the_score() {
    let h = harness().await;
    h.directory.add_contact(contact("c1", "pro")).await;
    let workflow = h.service.workflows().create(&branching_spec("u1")).await.unwrap();

    let execution = h
        .service
        .engine()
        .start_execution(&workflow.id, "c1", Value::Null)
        .await
        .unwrap();
    wait_for_execution_status(&h, &execution.id, ExecutionStatus::Completed).await;

    let report = h
        .service
        .workflows()
        .analytics(&workflow.id, AnalyticsRange::Day)
        .await
        .unwrap();
    assert_eq!(report.total_executions, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.completion_rate, 1.0);
    assert_eq!(report.error_rate, 0.0);
    assert!(report.performance_score > 0.9, "fast run scores near 1.0");

    // Score written back for performance-sorted listing
    let row: (f64,) = sqlx::query_as("SELECT performance_score FROM workflows WHERE id = ?")
        .bind(&workflow.id)
        .fetch_one(h.service.store().pool())
        .await
        .unwrap();
    assert!(row.0 > 0.9);

    assert!(matches!(
        h.service
            .workflows()
            .analytics("missing", AnalyticsRange::Week)
            .await,
        Err(EngineError::WorkflowNotFound(_))
    ));
}
