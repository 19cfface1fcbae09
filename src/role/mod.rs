//! Pluggable roles.
//!
//! A role is anything implementing [`Role`]; the runtime only knows its name
//! and calls `run` at the role's cadence under a per-invocation timeout.

pub mod builtin;
pub mod registry;

use crate::error::{AgentError, RoleError};
use crate::pairing::identity::AgentIdentity;
use crate::queue::ActionKind;
use crate::types::ActionId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

pub use registry::{
    Activation, RoleDescriptor, RoleDiscovery, RoleInstance, RoleRegistry, StaticDiscovery,
    EXTENSION_POINT,
};

/// What happened to a submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Sent and acknowledged by the console
    Delivered,
    /// Persisted in the durable queue
    Queued(ActionId),
    /// Dropped because an equivalent action is already pending
    Coalesced,
}

/// Handle through which roles and runtime units emit outbound actions.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn submit(&self, kind: ActionKind, payload: Value) -> Result<Submission, AgentError>;
}

/// Per-invocation context.
#[derive(Clone)]
pub struct RoleContext {
    pub role_name: String,
    pub identity: Option<AgentIdentity>,
    /// This role's table from `role_configs`
    pub config: Value,
    pub submitter: Arc<dyn ActionSink>,
    cancel: watch::Receiver<bool>,
}

impl RoleContext {
    pub fn new(
        role_name: impl Into<String>,
        identity: Option<AgentIdentity>,
        config: Value,
        submitter: Arc<dyn ActionSink>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            role_name: role_name.into(),
            identity,
            config,
            submitter,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is signalled (or the sender is gone).
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Output of one invocation. Each output becomes a `RoleResult` action, the
/// status (if any) a `StatusUpdate`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleResult {
    pub outputs: Vec<Value>,
    pub status: Option<Value>,
}

#[async_trait]
pub trait Role: Send + Sync {
    async fn run(&self, ctx: RoleContext) -> Result<RoleResult, RoleError>;
}
