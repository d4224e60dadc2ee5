//! Core workflow type definitions.
//!
//! Defines workflow graphs (nodes, connections, triggers), executions, and
//! per-node execution steps. Definitions are stored normalized in SQLite and
//! assembled into in-memory graphs for execution; cached copies are read-only
//! projections.

use crate::error::{EngineError, EngineResult};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A complete workflow definition with derived metadata
///
/// Assembled from the normalized store by joining nodes, connections, and
/// triggers for one workflow row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    /// Owning user id, used for per-user workflow list caching
    pub user_id: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub triggers: Vec<Trigger>,
    pub metadata: WorkflowMetadata,
    pub created_at: String,
    pub updated_at: String,
}

/// Derived metadata computed at assembly time, never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// node_count * 1.0 + connection_count * 0.5
    pub complexity: f64,
    pub node_count: usize,
    pub connection_count: usize,
    pub last_modified: String,
}

impl WorkflowDefinition {
    /// Recompute derived metadata from the current node/connection sets
    pub fn compute_metadata(&mut self) {
        self.metadata = WorkflowMetadata {
            complexity: self.nodes.len() as f64 + self.connections.len() as f64 * 0.5,
            node_count: self.nodes.len(),
            connection_count: self.connections.len(),
            last_modified: self.updated_at.clone(),
        };
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.active)
    }

    /// Outgoing connections from one node
    pub fn outgoing(&self, node_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .collect()
    }

    /// Entry nodes: trigger-typed nodes plus nodes referenced by an active
    /// Trigger record
    pub fn entry_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for node in self.active_nodes() {
            if node.node_type == NodeType::Trigger {
                ids.push(node.id.clone());
            }
        }
        for trigger in self.triggers.iter().filter(|t| t.active) {
            if !ids.contains(&trigger.node_id)
                && self.node(&trigger.node_id).is_some_and(|n| n.active)
            {
                ids.push(trigger.node_id.clone());
            }
        }
        ids
    }

    /// Rough duration estimate, snapshotted into the execution at start:
    /// 30s per node plus an extra 60s per delay node.
    pub fn estimated_duration_secs(&self) -> i64 {
        self.active_nodes()
            .map(|n| match n.node_type {
                NodeType::Delay => 90,
                _ => 30,
            })
            .sum()
    }
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    /// Node-specific configuration as flexible JSON
    pub config: Value,
    /// 2D canvas position, carried for the editor but unused by the engine
    pub position: Position,
    pub active: bool,
}

/// Closed set of node types
///
/// Unknown type strings deserialize to `Generic`, so the engine never stalls
/// on a node type it does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Renders content and hands it to a delivery provider
    MessageSend,
    /// Suspends the branch until an absolute fire time
    Delay,
    /// Evaluates one condition and gates YES/NO connections
    Condition,
    /// Entry point; fired by the trigger layer
    Trigger,
    /// Fallback for anything without a specialized handler
    #[serde(other)]
    Generic,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::MessageSend => "message_send",
            NodeType::Delay => "delay",
            NodeType::Condition => "condition",
            NodeType::Trigger => "trigger",
            NodeType::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "message_send" => NodeType::MessageSend,
            "delay" => NodeType::Delay,
            "condition" => NodeType::Condition,
            "trigger" => NodeType::Trigger,
            _ => NodeType::Generic,
        }
    }
}

/// 2D layout position on the workflow canvas
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed, conditionally-gated edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub condition_type: ConditionType,
    /// Expression text, only meaningful for `Custom`
    pub condition_value: Option<String>,
}

/// How a connection decides whether to fire after its source completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Unconditional
    Always,
    /// Fires when the step result's condition_met is true
    Yes,
    /// Fires when the step result's condition_met is false
    No,
    /// Restricted boolean expression evaluated against the step result
    Custom,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Always => "always",
            ConditionType::Yes => "yes",
            ConditionType::No => "no",
            ConditionType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "yes" => ConditionType::Yes,
            "no" => ConditionType::No,
            "custom" => ConditionType::Custom,
            _ => ConditionType::Always,
        }
    }
}

/// Trigger record associating an entry node with firing statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub node_id: String,
    pub trigger_type: String,
    pub condition: Value,
    pub active: bool,
    pub fire_count: i64,
    pub last_fired_at: Option<String>,
}

/// Lifecycle status of a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => WorkflowStatus::Active,
            "paused" => WorkflowStatus::Paused,
            "archived" => WorkflowStatus::Archived,
            _ => WorkflowStatus::Draft,
        }
    }
}

/// Complexity bucket derived from the active node count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplexityRating {
    Simple,
    Moderate,
    Complex,
    Advanced,
}

impl ComplexityRating {
    pub fn from_node_count(count: usize) -> Self {
        match count {
            0..=5 => ComplexityRating::Simple,
            6..=15 => ComplexityRating::Moderate,
            16..=30 => ComplexityRating::Complex,
            _ => ComplexityRating::Advanced,
        }
    }
}

/// One run of a workflow for a single contact
///
/// Invariant: at most one non-terminal execution exists per
/// (workflow_id, contact_id) pair; `start_execution` dedups against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub contact_id: String,
    pub status: ExecutionStatus,
    /// Complexity snapshot taken at start
    pub complexity: f64,
    /// Estimated duration snapshot taken at start
    pub estimated_duration_secs: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Execution state machine: Pending -> Running -> {Completed, Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ExecutionStatus::Running,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// Execution-time record of one node within one execution
///
/// One row per active node, materialized atomically with the execution.
/// Mutated only by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub execution_id: String,
    /// Equal to the node id in the definition snapshot
    pub step_id: String,
    pub node_type: NodeType,
    pub status: StepStatus,
    /// Absolute fire time, set only while Scheduled
    pub scheduled_for: Option<String>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// Step state machine: Pending -> Running -> {Completed, Failed, Scheduled}
///
/// Scheduled is reachable only from delay nodes and transitions back to
/// Running when the delayed continuation fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Scheduled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            "scheduled" => StepStatus::Scheduled,
            _ => StepStatus::Pending,
        }
    }
}

/// Input for create/update operations; children use replace semantics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub user_id: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub triggers: Vec<Trigger>,
}

/// Filters for workflow list queries
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilters {
    pub user_id: Option<String>,
    pub statuses: Vec<WorkflowStatus>,
    /// Case-insensitive search over name and description
    pub search: Option<String>,
    pub sort: SortKey,
    pub offset: i64,
    pub limit: i64,
}

impl WorkflowFilters {
    /// Stable signature used as the list-cache key
    pub fn signature(&self) -> String {
        let statuses: Vec<&str> = self.statuses.iter().map(|s| s.as_str()).collect();
        format!(
            "user:{}:st:{}:q:{}:sort:{}:{}:{}",
            self.user_id.as_deref().unwrap_or("*"),
            statuses.join(","),
            self.search.as_deref().unwrap_or(""),
            self.sort.as_str(),
            self.offset,
            self.limit.max(1),
        )
    }
}

/// Sort key for workflow listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    Name,
    CreatedAt,
    #[default]
    UpdatedAt,
    PerformanceScore,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::PerformanceScore => "performance_score",
        }
    }
}

/// Summary row returned by list queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub node_count: i64,
    pub performance_score: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// One page of workflow summaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPage {
    pub items: Vec<WorkflowSummary>,
    pub total: i64,
    pub has_more: bool,
}

/// Analytics window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsRange {
    Day,
    Week,
    Month,
}

impl AnalyticsRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsRange::Day => "day",
            AnalyticsRange::Week => "week",
            AnalyticsRange::Month => "month",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            AnalyticsRange::Day => chrono::Duration::days(1),
            AnalyticsRange::Week => chrono::Duration::weeks(1),
            AnalyticsRange::Month => chrono::Duration::days(30),
        }
    }
}

/// Aggregated execution report for one workflow over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub workflow_id: String,
    pub range: String,
    pub total_executions: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_completion_secs: f64,
    pub completion_rate: f64,
    pub error_rate: f64,
    /// completion_rate * 0.7 + time_score * 0.3, where time_score normalizes
    /// average completion time against a 5-minute baseline
    pub performance_score: f64,
}

/// Validate that nodes and connections form a DAG and that every connection
/// references known nodes. Runs before any create/update transaction commits.
pub fn validate_graph(nodes: &[Node], connections: &[Connection]) -> EngineResult<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index_by_id = HashMap::new();

    for node in nodes {
        if index_by_id.contains_key(node.id.as_str()) {
            return Err(EngineError::InvalidWorkflow(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
        let idx = graph.add_node(node.id.as_str());
        index_by_id.insert(node.id.as_str(), idx);
    }

    for conn in connections {
        let from = index_by_id.get(conn.source_node_id.as_str()).ok_or_else(|| {
            EngineError::InvalidWorkflow(format!(
                "connection references unknown node: {}",
                conn.source_node_id
            ))
        })?;
        let to = index_by_id.get(conn.target_node_id.as_str()).ok_or_else(|| {
            EngineError::InvalidWorkflow(format!(
                "connection references unknown node: {}",
                conn.target_node_id
            ))
        })?;
        graph.add_edge(*from, *to, ());
    }

    toposort(&graph, None)
        .map_err(|_| EngineError::InvalidWorkflow("workflow contains cycles".to_string()))?;

    Ok(())
}
