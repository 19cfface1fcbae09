//! Queued action records.

use crate::types::ActionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of outbound action; selects the console endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Heartbeat,
    RoleResult,
    StatusUpdate,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Heartbeat => "heartbeat",
            ActionKind::RoleResult => "role-result",
            ActionKind::StatusUpdate => "status-update",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable unit of outbound work.
///
/// `payload` holds the serialized JSON body; the queue never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedAction {
    pub fn payload_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Action removed from retry rotation, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: QueuedAction,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of recording a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Still pending; will be retried
    Retrying { attempts: u32 },
    /// Moved to the dead-letter record
    DeadLettered { attempts: u32 },
}
