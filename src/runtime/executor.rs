//! Node handlers and dispatch.
//!
//! Each node type maps to one handler; anything without a specialized handler
//! falls through to the generic pass-through so an execution never stalls on
//! an unrecognized node. Handlers return a JSON output object that the engine
//! appends to the execution context under the step id.

use crate::config::RateLimitConfig;
use crate::contact::ContactDirectory;
use crate::error::{EngineError, EngineResult};
use crate::messaging::{MessageSender, SendRequest};
use crate::runtime::context::ExecutionContext;
use crate::runtime::expr;
use crate::runtime::limiter::{LimitCheck, RateLimiter};
use crate::runtime::template;
use crate::workflow::types::{Node, NodeType};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One node-type handler
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<Value>;
}

/// Dispatch table from node type to handler
pub struct NodeExecutor {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
    generic: Arc<dyn NodeHandler>,
}

impl NodeExecutor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        sender: Arc<dyn MessageSender>,
        directory: Arc<dyn ContactDirectory>,
        rate_limits: RateLimitConfig,
    ) -> Self {
        let mut handlers: HashMap<NodeType, Arc<dyn NodeHandler>> = HashMap::new();
        handlers.insert(
            NodeType::MessageSend,
            Arc::new(MessageSendHandler {
                sender,
                limiter,
                messages_per_hour: rate_limits.contact_messages_per_hour,
            }),
        );
        handlers.insert(NodeType::Delay, Arc::new(DelayHandler));
        handlers.insert(NodeType::Condition, Arc::new(ConditionHandler { directory }));

        Self {
            handlers,
            generic: Arc::new(GenericHandler),
        }
    }

    pub async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<Value> {
        let handler = self.handlers.get(&node.node_type).unwrap_or(&self.generic);
        handler.execute(node, ctx).await
    }
}

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

/// Renders message content and hands it to the delivery provider.
///
/// Gated by the per-contact message limiter; a rejection fails the step
/// without touching the provider.
struct MessageSendHandler {
    sender: Arc<dyn MessageSender>,
    limiter: Arc<RateLimiter>,
    messages_per_hour: u32,
}

#[async_trait]
impl NodeHandler for MessageSendHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<Value> {
        let check = LimitCheck::new(
            format!("msg:{}", ctx.contact_id),
            self.messages_per_hour,
            Duration::from_secs(3600),
        );
        if !self.limiter.check(&check).await {
            return Err(EngineError::RateLimitExceeded { limiter: check.key });
        }

        let channel = config_str(&node.config, "channel").unwrap_or("email");
        let recipient = match channel {
            "sms" => ctx.contact.get("phone").and_then(Value::as_str),
            _ => ctx.contact.get("email").and_then(Value::as_str),
        }
        .ok_or_else(|| EngineError::NodeExecutionFailed {
            node_id: node.id.clone(),
            message: format!("contact has no {channel} address"),
        })?
        .to_string();

        let body_template = config_str(&node.config, "body")
            .or_else(|| config_str(&node.config, "content"))
            .ok_or_else(|| EngineError::NodeExecutionFailed {
                node_id: node.id.clone(),
                message: "message node has no body".to_string(),
            })?;

        let scope = ctx.scope();
        let subject = config_str(&node.config, "subject").map(|s| template::render(s, &scope));
        let body = template::render(body_template, &scope);

        let receipt = self
            .sender
            .send(SendRequest {
                recipient: recipient.clone(),
                channel: channel.to_string(),
                subject,
                body,
                tracking: json!({
                    "workflow_id": ctx.workflow_id,
                    "execution_id": ctx.execution_id,
                    "step_id": node.id,
                }),
            })
            .await?;

        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %node.id,
            tracking_id = %receipt.tracking_id,
            "📨 message accepted by provider"
        );

        Ok(json!({
            "tracking_id": receipt.tracking_id,
            "sent_at": receipt.accepted_at.to_rfc3339(),
            "recipient": recipient,
            "channel": channel,
        }))
    }
}

/// Computes the absolute fire time for a delay node.
///
/// The output's `scheduled_for` key is the engine's signal to park the step
/// as Scheduled and enqueue a delayed continuation instead of following
/// connections.
struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> EngineResult<Value> {
        let amount = node
            .config
            .get("amount")
            .and_then(expr_amount)
            .ok_or_else(|| EngineError::NodeExecutionFailed {
                node_id: node.id.clone(),
                message: "delay node has no positive amount".to_string(),
            })?;

        let unit = config_str(&node.config, "unit").unwrap_or("hours");
        let per_unit_secs = match unit {
            "minutes" => 60,
            "hours" => 3600,
            "days" => 86_400,
            other => {
                return Err(EngineError::NodeExecutionFailed {
                    node_id: node.id.clone(),
                    message: format!("unknown delay unit: {other}"),
                })
            }
        };

        let delay_secs = amount * per_unit_secs;
        let scheduled_for = Utc::now() + ChronoDuration::seconds(delay_secs);

        Ok(json!({
            "scheduled_for": scheduled_for.to_rfc3339(),
            "delay_secs": delay_secs,
        }))
    }
}

fn expr_amount(value: &Value) -> Option<i64> {
    let n = expr::as_number(value)?;
    (n > 0.0).then_some(n as i64)
}

/// Evaluates one condition and emits `condition_met` for YES/NO gating.
struct ConditionHandler {
    directory: Arc<dyn ContactDirectory>,
}

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<Value> {
        let kind = config_str(&node.config, "condition_type").unwrap_or("custom");

        let met = match kind {
            "contact_property" => self.contact_property(node, ctx)?,
            "email_engagement" => self.email_engagement(node, ctx).await?,
            "custom" => {
                let expression = config_str(&node.config, "expression").ok_or_else(|| {
                    EngineError::NodeExecutionFailed {
                        node_id: node.id.clone(),
                        message: "custom condition has no expression".to_string(),
                    }
                })?;
                expr::evaluate(expression, &ctx.scope())?
            }
            other => {
                return Err(EngineError::NodeExecutionFailed {
                    node_id: node.id.clone(),
                    message: format!("unknown condition type: {other}"),
                })
            }
        };

        Ok(json!({
            "condition_met": met,
            "condition_type": kind,
        }))
    }
}

impl ConditionHandler {
    fn contact_property(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<bool> {
        let property =
            config_str(&node.config, "property").ok_or_else(|| EngineError::NodeExecutionFailed {
                node_id: node.id.clone(),
                message: "contact_property condition has no property".to_string(),
            })?;
        let operator = config_str(&node.config, "operator").unwrap_or("equals");
        let expected = node.config.get("value").cloned().unwrap_or(Value::Null);
        let actual = ctx.contact.get(property).cloned().unwrap_or(Value::Null);

        let met = match operator {
            "exists" => !actual.is_null(),
            "equals" => {
                if let (Some(l), Some(r)) = (expr::as_number(&actual), expr::as_number(&expected)) {
                    l == r
                } else {
                    actual == expected
                }
            }
            "contains" => match (&actual, &expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            "greater_than" => matches!(
                (expr::as_number(&actual), expr::as_number(&expected)),
                (Some(l), Some(r)) if l > r
            ),
            "less_than" => matches!(
                (expr::as_number(&actual), expr::as_number(&expected)),
                (Some(l), Some(r)) if l < r
            ),
            other => {
                return Err(EngineError::NodeExecutionFailed {
                    node_id: node.id.clone(),
                    message: format!("unknown property operator: {other}"),
                })
            }
        };

        Ok(met)
    }

    async fn email_engagement(&self, node: &Node, ctx: &ExecutionContext) -> EngineResult<bool> {
        let timeframe_days = node
            .config
            .get("timeframe_days")
            .and_then(expr::as_number)
            .filter(|d| *d > 0.0)
            .unwrap_or(7.0);
        let since = Utc::now() - ChronoDuration::seconds((timeframe_days * 86_400.0) as i64);

        let events = self
            .directory
            .engagement_events(&ctx.contact_id, since)
            .await?;

        let kind_filter = config_str(&node.config, "engagement_kind");
        let matched = match kind_filter {
            Some(kind) => events.iter().filter(|e| e.kind == kind).count(),
            None => events.len(),
        };

        Ok(matched > 0)
    }
}

/// Pass-through for trigger nodes and anything unrecognized
struct GenericHandler;

#[async_trait]
impl NodeHandler for GenericHandler {
    async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> EngineResult<Value> {
        Ok(json!({
            "completed": true,
            "node_type": node.node_type.as_str(),
            "executed_at": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{ContactSnapshot, InMemoryContactDirectory};
    use crate::messaging::RecordingSender;
    use crate::workflow::types::{
        Position, WorkflowDefinition, WorkflowMetadata, WorkflowStatus,
    };

    fn test_node(node_type: NodeType, config: Value) -> Node {
        Node {
            id: "n1".to_string(),
            node_type,
            label: "n1".to_string(),
            config,
            position: Position::default(),
            active: true,
        }
    }

    fn test_context(contact: &ContactSnapshot) -> ExecutionContext {
        let definition = WorkflowDefinition {
            id: "wf1".to_string(),
            name: "welcome".to_string(),
            description: None,
            status: WorkflowStatus::Active,
            user_id: "u1".to_string(),
            nodes: vec![],
            connections: vec![],
            triggers: vec![],
            metadata: WorkflowMetadata {
                complexity: 0.0,
                node_count: 0,
                connection_count: 0,
                last_modified: String::new(),
            },
            created_at: String::new(),
            updated_at: String::new(),
        };
        ExecutionContext::new("exec1", definition, contact, &Value::Null)
    }

    fn contact() -> ContactSnapshot {
        ContactSnapshot {
            id: "c1".to_string(),
            email: Some("ada@example.com".to_string()),
            phone: None,
            properties: json!({"first_name": "Ada", "plan": "pro", "score": "42", "tags": ["vip"]}),
        }
    }

    fn executor(sender: Arc<RecordingSender>, directory: Arc<InMemoryContactDirectory>) -> NodeExecutor {
        NodeExecutor::new(
            Arc::new(RateLimiter::new()),
            sender,
            directory,
            RateLimitConfig::default(),
        )
    }

    #[tokio::test]
    async fn message_send_renders_and_records_tracking_id() {
        let sender = Arc::new(RecordingSender::new());
        let exec = executor(sender.clone(), Arc::new(InMemoryContactDirectory::new()));
        let node = test_node(
            NodeType::MessageSend,
            json!({"subject": "Hi {{contact.first_name}}", "body": "Welcome to {{workflow.name}}!"}),
        );

        let output = exec.execute(&node, &test_context(&contact())).await.unwrap();
        assert!(output["tracking_id"].as_str().unwrap().starts_with("msg-"));

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject.as_deref(), Some("Hi Ada"));
        assert_eq!(sent[0].body, "Welcome to welcome!");
        assert_eq!(sent[0].recipient, "ada@example.com");
    }

    #[tokio::test]
    async fn delay_computes_absolute_fire_time() {
        let exec = executor(
            Arc::new(RecordingSender::new()),
            Arc::new(InMemoryContactDirectory::new()),
        );
        let node = test_node(NodeType::Delay, json!({"amount": 2, "unit": "hours"}));

        let before = Utc::now();
        let output = exec.execute(&node, &test_context(&contact())).await.unwrap();
        assert_eq!(output["delay_secs"], json!(7200));

        let fire_at: chrono::DateTime<Utc> = output["scheduled_for"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let expected = before + ChronoDuration::hours(2);
        assert!((fire_at - expected).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn delay_rejects_missing_amount() {
        let exec = executor(
            Arc::new(RecordingSender::new()),
            Arc::new(InMemoryContactDirectory::new()),
        );
        let node = test_node(NodeType::Delay, json!({"unit": "hours"}));
        assert!(exec.execute(&node, &test_context(&contact())).await.is_err());
    }

    #[tokio::test]
    async fn contact_property_operators() {
        let exec = executor(
            Arc::new(RecordingSender::new()),
            Arc::new(InMemoryContactDirectory::new()),
        );
        let ctx = test_context(&contact());

        let cases = [
            (json!({"condition_type": "contact_property", "property": "plan", "operator": "equals", "value": "pro"}), true),
            (json!({"condition_type": "contact_property", "property": "plan", "operator": "equals", "value": "free"}), false),
            (json!({"condition_type": "contact_property", "property": "score", "operator": "greater_than", "value": 40}), true),
            (json!({"condition_type": "contact_property", "property": "score", "operator": "less_than", "value": 40}), false),
            (json!({"condition_type": "contact_property", "property": "email", "operator": "exists"}), true),
            (json!({"condition_type": "contact_property", "property": "nickname", "operator": "exists"}), false),
            (json!({"condition_type": "contact_property", "property": "tags", "operator": "contains", "value": "vip"}), true),
        ];

        for (config, expected) in cases {
            let node = test_node(NodeType::Condition, config.clone());
            let output = exec.execute(&node, &ctx).await.unwrap();
            assert_eq!(output["condition_met"], json!(expected), "config: {config}");
        }
    }

    #[tokio::test]
    async fn email_engagement_window() {
        let directory = Arc::new(InMemoryContactDirectory::new());
        directory.add_contact(contact()).await;
        directory
            .add_event("c1", "open", Utc::now() - ChronoDuration::days(2))
            .await;
        directory
            .add_event("c1", "click", Utc::now() - ChronoDuration::days(30))
            .await;

        let exec = executor(Arc::new(RecordingSender::new()), directory);
        let ctx = test_context(&contact());

        let recent = test_node(
            NodeType::Condition,
            json!({"condition_type": "email_engagement", "timeframe_days": 7}),
        );
        let output = exec.execute(&recent, &ctx).await.unwrap();
        assert_eq!(output["condition_met"], json!(true));

        let narrow = test_node(
            NodeType::Condition,
            json!({"condition_type": "email_engagement", "timeframe_days": 1}),
        );
        let output = exec.execute(&narrow, &ctx).await.unwrap();
        assert_eq!(output["condition_met"], json!(false));
    }

    #[tokio::test]
    async fn generic_handler_covers_unknown_types() {
        let exec = executor(
            Arc::new(RecordingSender::new()),
            Arc::new(InMemoryContactDirectory::new()),
        );
        let node = test_node(NodeType::Generic, json!({}));
        let output = exec.execute(&node, &test_context(&contact())).await.unwrap();
        assert_eq!(output["completed"], json!(true));
    }
}
