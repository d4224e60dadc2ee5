//! Shared fixtures for integration tests.

#![allow(dead_code)]

use pulseflow::config::{CacheConfig, Config, DatabaseConfig, RateLimitConfig};
use pulseflow::contact::{ContactSnapshot, InMemoryContactDirectory};
use pulseflow::messaging::RecordingSender;
use pulseflow::workflow::types::{
    ConditionType, Connection, Node, NodeType, Position, Trigger, WorkflowSpec, WorkflowStatus,
};
use pulseflow::AutomationService;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-memory SQLite pool. A single connection is required: every pooled
/// connection would otherwise open its own empty :memory: database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool")
}

pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        cache: CacheConfig {
            definition_ttl: Duration::from_secs(900),
            context_ttl: Duration::from_secs(300),
            user_list_ttl: Duration::from_secs(60),
            analytics_ttl: Duration::from_secs(1800),
            l2_ttl_multiplier: 2,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            warm_cron: None,
            warm_cycle_cap: 50,
        },
        rate_limits: RateLimitConfig {
            contact_starts_per_hour: 20,
            system_starts_per_minute: 600,
            contact_messages_per_hour: 30,
        },
    }
}

pub struct TestHarness {
    pub service: AutomationService,
    pub sender: Arc<RecordingSender>,
    pub directory: Arc<InMemoryContactDirectory>,
}

/// Assemble a started service over an in-memory database
pub async fn harness() -> TestHarness {
    harness_with_config(test_config()).await
}

pub async fn harness_with_config(config: Config) -> TestHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sender = Arc::new(RecordingSender::new());
    let directory = Arc::new(InMemoryContactDirectory::new());
    let service = AutomationService::with_pool(
        config,
        memory_pool().await,
        directory.clone(),
        sender.clone(),
    )
    .await
    .expect("service assembly");
    service.start().await.expect("service start");

    TestHarness {
        service,
        sender,
        directory,
    }
}

pub fn node(id: &str, node_type: NodeType, config: Value) -> Node {
    Node {
        id: id.to_string(),
        node_type,
        label: id.to_string(),
        config,
        position: Position::default(),
        active: true,
    }
}

pub fn connect(id: &str, from: &str, to: &str, condition_type: ConditionType) -> Connection {
    Connection {
        id: id.to_string(),
        source_node_id: from.to_string(),
        target_node_id: to.to_string(),
        condition_type,
        condition_value: None,
    }
}

pub fn trigger(id: &str, node_id: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        node_id: node_id.to_string(),
        trigger_type: "contact_created".to_string(),
        condition: json!({}),
        active: true,
        fire_count: 0,
        last_fired_at: None,
    }
}

pub fn contact(id: &str, plan: &str) -> ContactSnapshot {
    ContactSnapshot {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        phone: None,
        properties: json!({"first_name": "Ada", "plan": plan}),
    }
}

/// Trigger -> plan condition -> YES message / NO message
pub fn branching_spec(user_id: &str) -> WorkflowSpec {
    WorkflowSpec {
        name: "welcome".to_string(),
        description: None,
        status: WorkflowStatus::Active,
        user_id: user_id.to_string(),
        nodes: vec![
            node("t1", NodeType::Trigger, json!({})),
            node(
                "c1",
                NodeType::Condition,
                json!({
                    "condition_type": "contact_property",
                    "property": "plan",
                    "operator": "equals",
                    "value": "pro",
                }),
            ),
            node(
                "m_pro",
                NodeType::MessageSend,
                json!({"subject": "Hi {{contact.first_name}}", "body": "Thanks for going pro!"}),
            ),
            node(
                "m_free",
                NodeType::MessageSend,
                json!({"body": "Upgrade today, {{contact.first_name}}!"}),
            ),
        ],
        connections: vec![
            connect("e1", "t1", "c1", ConditionType::Always),
            connect("e2", "c1", "m_pro", ConditionType::Yes),
            connect("e3", "c1", "m_free", ConditionType::No),
        ],
        triggers: vec![trigger("tr1", "t1")],
    }
}

/// Trigger -> 2 hour delay -> message
pub fn delayed_spec(user_id: &str) -> WorkflowSpec {
    WorkflowSpec {
        name: "drip".to_string(),
        description: None,
        status: WorkflowStatus::Active,
        user_id: user_id.to_string(),
        nodes: vec![
            node("t1", NodeType::Trigger, json!({})),
            node("d1", NodeType::Delay, json!({"amount": 2, "unit": "hours"})),
            node(
                "m1",
                NodeType::MessageSend,
                json!({"body": "Still there, {{contact.first_name}}?"}),
            ),
        ],
        connections: vec![
            connect("e1", "t1", "d1", ConditionType::Always),
            connect("e2", "d1", "m1", ConditionType::Always),
        ],
        triggers: vec![trigger("tr1", "t1")],
    }
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
