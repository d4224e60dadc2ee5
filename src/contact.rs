//! Contact directory seam.
//!
//! The engine never owns contact data; it takes a read-only snapshot at
//! execution start and evaluates engagement conditions through this trait.

use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Point-in-time snapshot of a contact, embedded into the execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Free-form contact properties (plan, engaged, signup_source, ...)
    pub properties: Value,
}

impl ContactSnapshot {
    /// Flatten the snapshot into a single JSON object so condition paths like
    /// `contact.engaged` resolve without knowing which fields are properties.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Value::Object(props) = &self.properties {
            for (k, v) in props {
                obj.insert(k.clone(), v.clone());
            }
        }
        obj.insert("id".to_string(), json!(self.id));
        obj.insert("email".to_string(), json!(self.email));
        obj.insert("phone".to_string(), json!(self.phone));
        Value::Object(obj)
    }
}

/// One recorded engagement event (open, click, reply, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
}

/// Read-only lookup into the contact system
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Fetch a snapshot by contact id; None when the contact does not exist
    async fn get_contact(&self, id: &str) -> EngineResult<Option<ContactSnapshot>>;

    /// Engagement events for a contact since the given instant
    async fn engagement_events(
        &self,
        contact_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<EngagementEvent>>;
}

/// In-memory directory for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryContactDirectory {
    contacts: RwLock<HashMap<String, ContactSnapshot>>,
    events: RwLock<HashMap<String, Vec<EngagementEvent>>>,
}

impl InMemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_contact(&self, snapshot: ContactSnapshot) {
        self.contacts
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn add_event(&self, contact_id: &str, kind: &str, occurred_at: DateTime<Utc>) {
        self.events
            .write()
            .await
            .entry(contact_id.to_string())
            .or_default()
            .push(EngagementEvent {
                kind: kind.to_string(),
                occurred_at,
            });
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContactDirectory {
    async fn get_contact(&self, id: &str) -> EngineResult<Option<ContactSnapshot>> {
        Ok(self.contacts.read().await.get(id).cloned())
    }

    async fn engagement_events(
        &self,
        contact_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<EngagementEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(contact_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
