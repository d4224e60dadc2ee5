//! Message delivery seam.
//!
//! Delivery providers (email, SMS, chat) live outside the engine. The
//! message-send handler renders content, hands it to a `MessageSender`, and
//! records the returned tracking id in the step output.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A fully rendered send request handed to a delivery provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    /// Delivery channel hint ("email", "sms", "chat")
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    /// Tracking metadata (workflow_id, execution_id, step_id)
    pub tracking: Value,
}

/// Provider acknowledgment for an accepted message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub tracking_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// External delivery provider contract
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, request: SendRequest) -> EngineResult<SendReceipt>;
}

/// Sender that records requests in memory instead of delivering them.
/// Used in tests and as a dry-run provider.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SendRequest>>,
    fail_next: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next send fail, for exercising the failure path
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, request: SendRequest) -> EngineResult<SendReceipt> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Delivery("provider rejected message".to_string()));
        }
        self.sent.lock().await.push(request);
        Ok(SendReceipt {
            tracking_id: format!("msg-{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
        })
    }
}
