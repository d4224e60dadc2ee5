//! Pulseflow: an embeddable marketing automation workflow engine.
//!
//! Workflows are directed acyclic graphs of typed nodes (message sends,
//! delays, conditions, triggers) executed per contact. Definitions live in
//! SQLite behind a three-tier cache hierarchy; executions advance through a
//! priority work queue with all state externalized to a versioned context
//! document, so delayed branches survive restarts without retained memory.

pub mod cache;
pub mod config;
pub mod contact;
pub mod error;
pub mod messaging;
pub mod runtime;
pub mod service;
pub mod workflow;

pub use cache::{CacheHierarchy, CacheMetrics, DataClass};
pub use config::Config;
pub use contact::{ContactDirectory, ContactSnapshot, InMemoryContactDirectory};
pub use error::{EngineError, EngineResult};
pub use messaging::{MessageSender, RecordingSender, SendReceipt, SendRequest};
pub use runtime::engine::ExecutionEngine;
pub use service::AutomationService;
pub use workflow::query::WorkflowQueryService;
pub use workflow::storage::WorkflowStore;
pub use workflow::types::{
    AnalyticsRange, AnalyticsReport, ComplexityRating, Connection, ConditionType, Execution,
    ExecutionStatus, ExecutionStep, Node, NodeType, StepStatus, Trigger, WorkflowDefinition,
    WorkflowFilters, WorkflowPage, WorkflowSpec, WorkflowStatus, WorkflowSummary,
};
