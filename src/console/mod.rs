//! Console client: the agent's only outbound collaborator.
//!
//! Endpoints, relative to the console URL:
//! - `POST pair` with `{token, groups, name}`
//! - `POST agents/{id}/heartbeat`
//! - `POST agents/{id}/results` for role results
//! - `POST agents/{id}/status` for status updates
//! - `GET agents/{id}/policy`

#[cfg(test)]
pub(crate) mod fake;
pub mod http;

use crate::error::ConsoleError;
use crate::pairing::identity::{AgentIdentity, PairingToken};
use crate::queue::ActionKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub use http::HttpConsoleClient;

/// One registration exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRequest {
    pub console_url: String,
    pub token: PairingToken,
    pub groups: BTreeSet<String>,
    /// Agent display name
    pub name: String,
}

/// Console acknowledgment of a registration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PairAck {
    pub agent_id: Option<String>,
    /// Credential to use instead of the pairing token, when issued
    pub access_token: Option<String>,
    /// Console reported an existing registration (HTTP 409)
    pub already_registered: bool,
}

/// Liveness report body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub name: String,
    pub version: String,
    pub state: String,
    pub healthy: bool,
    pub health_issues: Vec<String>,
    pub queue_depth: usize,
    pub dead_letters: usize,
}

/// Settings pushed by the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub revision: u64,
    pub uuid: String,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

#[async_trait]
pub trait ConsoleClient: Send + Sync {
    async fn pair(&self, request: &PairRequest) -> Result<PairAck, ConsoleError>;

    async fn heartbeat(
        &self,
        identity: &AgentIdentity,
        body: &HeartbeatBody,
    ) -> Result<(), ConsoleError>;

    /// Deliver an action body to its kind-specific endpoint. Any non-2xx is an error.
    async fn deliver(
        &self,
        identity: &AgentIdentity,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(), ConsoleError>;

    /// `Ok(None)` when the console has no policy for this agent.
    async fn fetch_policy(
        &self,
        identity: &AgentIdentity,
    ) -> Result<Option<AgentPolicy>, ConsoleError>;
}

/// Path of the endpoint receiving actions of `kind`.
pub fn endpoint_for(kind: ActionKind, agent_id: &str) -> String {
    let suffix = match kind {
        ActionKind::Heartbeat => "heartbeat",
        ActionKind::RoleResult => "results",
        ActionKind::StatusUpdate => "status",
    };
    format!("agents/{}/{}", agent_id, suffix)
}

/// Join a console base URL and a relative path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
