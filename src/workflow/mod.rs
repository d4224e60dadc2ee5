//! Workflow definitions, durable storage, and the cached query surface.

pub mod query;
pub mod storage;
pub mod types;
