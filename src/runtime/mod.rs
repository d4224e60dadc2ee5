//! Execution runtime: engine, node handlers, queues, and evaluation helpers.

pub mod context;
pub mod engine;
pub mod executor;
pub mod expr;
pub mod limiter;
pub mod queue;
pub mod template;
