use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ExecutionId;

/// Kind of event an execution waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Point-to-point message, delivered to one execution
    Message,
    /// Broadcast signal, delivered to every subscriber
    Signal,
}

/// Persistent registration of an execution waiting for a named event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Subscription id
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Message or signal
    pub event_type: EventType,
    /// Event name
    pub event_name: String,
    /// Waiting execution
    pub execution_id: ExecutionId,
    /// Process instance of that execution
    pub process_instance_id: ExecutionId,
    /// Node that reacts when the event arrives
    pub activity_id: String,
    /// Opaque configuration
    pub configuration: Option<String>,
    /// Owning tenant
    pub tenant_id: Option<String>,
    /// Creation time
    pub created: DateTime<Utc>,
}
