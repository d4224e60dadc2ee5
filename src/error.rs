//! Typed error taxonomy for the engine.
//!
//! Execution-start failures (NotFound, RateLimitExceeded) fail fast at the
//! call site. Step-level failures are recorded durably on the step row and
//! re-thrown to the queue consumer. Cache backend errors never surface here;
//! they are logged and treated as misses at the call site.

use thiserror::Error;

/// All failures surfaced by the engine's service boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// A named rate limiter rejected the action. No state was created.
    #[error("rate limit exceeded: {limiter}")]
    RateLimitExceeded { limiter: String },

    /// A node handler failed; the step row carries the same message.
    #[error("node execution failed for '{node_id}': {message}")]
    NodeExecutionFailed { node_id: String, message: String },

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("expression error: {0}")]
    Expression(String),

    /// Optimistic context write lost the race twice in a row.
    #[error("context version conflict for execution {0}")]
    ContextConflict(String),

    #[error("message delivery failed: {0}")]
    Delivery(String),

    #[error("queue unavailable: {0}")]
    QueueClosed(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
