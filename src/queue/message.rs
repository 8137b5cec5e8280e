use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two durable queues. `Main` holds mutating requests awaiting
/// re-delivery; `DeadLetter` quarantines messages that exhausted retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Main,
    DeadLetter,
}

impl QueueKind {
    /// Backing-store list key.
    pub fn key(self) -> &'static str {
        match self {
            QueueKind::Main => "request_queue",
            QueueKind::DeadLetter => "dead_letter_queue",
        }
    }

    /// Operator-facing name, as accepted in `queue_type` request fields.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Main => "main",
            QueueKind::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" | "request_queue" => Some(QueueKind::Main),
            "dead_letter" | "dead_letter_queue" => Some(QueueKind::DeadLetter),
            _ => None,
        }
    }
}

/// The canonical unit in both queues. Serialized as JSON into the backing
/// store; the schema is shared by the proxy (producer), the worker
/// (consumer) and the ops surface (observer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique opaque id, assigned at enqueue, immutable.
    pub id: String,

    /// Enqueue time.
    pub timestamp: DateTime<Utc>,

    /// Target service name (must exist in the descriptor table).
    pub service: String,

    /// Upstream path, beginning with `/`, including any subresource.
    pub endpoint: String,

    /// Uppercased HTTP verb. Only POST/PUT/DELETE enter the main queue.
    pub method: String,

    /// Structured body payload, opaque to the gateway.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Request headers to forward (already filtered).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Derived from the method (GET=1, PUT=2, POST=3, DELETE=4). Carried
    /// for observability; does not reorder the queue.
    #[serde(default)]
    pub priority: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Set only when the message is moved to the dead-letter queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_timestamp: Option<DateTime<Utc>>,

    /// Earliest time the worker may re-execute this message. Stamped on
    /// requeue instead of sleeping in the drain loop; not-yet-due messages
    /// are rotated back to the head.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    3
}

/// Observability priority of an HTTP verb.
pub fn method_priority(method: &str) -> u8 {
    match method {
        "GET" => 1,
        "PUT" => 2,
        "POST" => 3,
        "DELETE" => 4,
        _ => 0,
    }
}

/// Only these verbs are eligible for store-and-forward queueing.
pub fn is_mutating(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "DELETE")
}

impl QueuedMessage {
    /// Whether the message is due for execution.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|nb| nb <= now).unwrap_or(true)
    }
}
