//! Durable store behavior: round-trips, replace semantics, validation, and
//! list queries.

mod common;

use common::*;
use pulseflow::workflow::storage::WorkflowStore;
use pulseflow::workflow::types::{
    ConditionType, NodeType, SortKey, WorkflowFilters, WorkflowStatus,
};
use pulseflow::EngineError;
use serde_json::json;

async fn store() -> WorkflowStore {
    let store = WorkflowStore::new(memory_pool().await);
    store.init_schema().await.expect("schema");
    store
}

#[tokio::test]
async fn definition_round_trips_through_store() {
    let store = store().await;
    let created = store.create_workflow(&branching_spec("u1")).await.unwrap();

    let fetched = store
        .get_definition(&created.id, false)
        .await
        .unwrap()
        .expect("definition");

    assert_eq!(fetched.name, "welcome");
    assert_eq!(fetched.user_id, "u1");
    assert_eq!(fetched.status, WorkflowStatus::Active);
    assert_eq!(fetched.nodes.len(), 4);
    assert_eq!(fetched.connections.len(), 3);
    assert_eq!(fetched.triggers.len(), 1);

    let condition = fetched.node("c1").expect("condition node");
    assert_eq!(condition.node_type, NodeType::Condition);
    assert_eq!(condition.config["property"], json!("plan"));

    // 4 nodes + 3 connections * 0.5
    assert_eq!(fetched.metadata.complexity, 5.5);
    assert_eq!(fetched.metadata.node_count, 4);
}

#[tokio::test]
async fn update_replaces_graph_children() {
    let store = store().await;
    let created = store.create_workflow(&branching_spec("u1")).await.unwrap();

    let mut spec = delayed_spec("u1");
    spec.name = "welcome v2".to_string();
    let updated = store.update_workflow(&created.id, &spec).await.unwrap();

    assert_eq!(updated.id, created.id);
    assert_eq!(updated.name, "welcome v2");
    assert_eq!(updated.nodes.len(), 3);
    assert!(updated.node("c1").is_none(), "old nodes must be gone");
    assert!(updated.node("d1").is_some());
}

#[tokio::test]
async fn update_of_missing_workflow_errors() {
    let store = store().await;
    let result = store.update_workflow("nope", &branching_spec("u1")).await;
    assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));
}

#[tokio::test]
async fn cyclic_graph_is_rejected_before_any_write() {
    let store = store().await;

    let mut spec = branching_spec("u1");
    spec.connections
        .push(connect("loop", "m_pro", "t1", ConditionType::Always));

    assert!(matches!(
        store.create_workflow(&spec).await,
        Err(EngineError::InvalidWorkflow(_))
    ));

    let page = store
        .list_workflows(&WorkflowFilters {
            user_id: Some("u1".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 0, "failed create must leave nothing behind");
}

#[tokio::test]
async fn inactive_nodes_are_filtered_unless_requested() {
    let store = store().await;

    let mut spec = branching_spec("u1");
    spec.nodes[3].active = false; // m_free
    let created = store.create_workflow(&spec).await.unwrap();

    let active_view = store
        .get_definition(&created.id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(active_view.node("m_free").is_none());
    assert_eq!(active_view.nodes.len(), 3);

    let editor_view = store
        .get_definition(&created.id, true)
        .await
        .unwrap()
        .unwrap();
    assert!(editor_view.node("m_free").is_some_and(|n| !n.active));
}

#[tokio::test]
async fn list_filters_paginate_and_search() {
    let store = store().await;

    let mut a = branching_spec("u1");
    a.name = "onboarding drip".to_string();
    let mut b = branching_spec("u1");
    b.name = "churn rescue".to_string();
    let mut c = branching_spec("u1");
    c.name = "weekly digest".to_string();
    c.status = WorkflowStatus::Draft;
    let other_user = branching_spec("u2");

    for spec in [&a, &b, &c, &other_user] {
        store.create_workflow(spec).await.unwrap();
    }

    let all_u1 = store
        .list_workflows(&WorkflowFilters {
            user_id: Some("u1".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all_u1.total, 3);
    assert!(!all_u1.has_more);

    let active_only = store
        .list_workflows(&WorkflowFilters {
            user_id: Some("u1".to_string()),
            statuses: vec![WorkflowStatus::Active],
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active_only.total, 2);

    let searched = store
        .list_workflows(&WorkflowFilters {
            user_id: Some("u1".to_string()),
            search: Some("CHURN".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(searched.total, 1);
    assert_eq!(searched.items[0].name, "churn rescue");

    let first_page = store
        .list_workflows(&WorkflowFilters {
            user_id: Some("u1".to_string()),
            sort: SortKey::Name,
            limit: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first_page.items.len(), 2);
    assert_eq!(first_page.total, 3);
    assert!(first_page.has_more);
}

#[tokio::test]
async fn trigger_fire_updates_statistics() {
    let store = store().await;
    let created = store.create_workflow(&branching_spec("u1")).await.unwrap();

    store.record_trigger_fire(&created.id, "t1").await.unwrap();
    store.record_trigger_fire(&created.id, "t1").await.unwrap();

    let fetched = store
        .get_definition(&created.id, false)
        .await
        .unwrap()
        .unwrap();
    let trigger = &fetched.triggers[0];
    assert_eq!(trigger.fire_count, 2);
    assert!(trigger.last_fired_at.is_some());
}
