//! Pairing state machine.
//!
//! Only one `pair`/`reset_pairing` exchange runs at a time; a concurrent caller
//! fails fast with [`PairingError::InProgress`]. A failed pairing never
//! persists an identity.

use super::identity::{AgentIdentity, PairingStatus, PairingToken};
use crate::config::ConfigStore;
use crate::console::{ConsoleClient, PairAck, PairRequest};
use crate::error::PairingError;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Details of the last failed exchange, kept for retry.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingAttempt {
    pub console_url: String,
    pub groups: BTreeSet<String>,
    pub error: String,
    pub at: DateTime<Utc>,
}

pub struct PairingMachine {
    store: Arc<ConfigStore>,
    client: Arc<dyn ConsoleClient>,
    status: RwLock<PairingStatus>,
    last_attempt: RwLock<Option<PairingAttempt>>,
    exchange: tokio::sync::Mutex<()>,
}

impl PairingMachine {
    /// Initial state comes from the persisted identity, `Unpaired` without one.
    pub fn new(store: Arc<ConfigStore>, client: Arc<dyn ConsoleClient>) -> Self {
        let status = match store.identity() {
            Some(identity) if identity.status == PairingStatus::Revoked => PairingStatus::Revoked,
            Some(_) => PairingStatus::Paired,
            None => PairingStatus::Unpaired,
        };
        Self {
            store,
            client,
            status: RwLock::new(status),
            last_attempt: RwLock::new(None),
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    /// Tracked state, reconciled with the stored identity: an identity
    /// removed behind the machine's back reads as `Unpaired`.
    pub fn current_state(&self) -> PairingStatus {
        let status = *self.status.read();
        match (status, self.store.identity()) {
            (PairingStatus::Paired | PairingStatus::Revoked, None) => PairingStatus::Unpaired,
            (PairingStatus::Paired, Some(identity)) if identity.status == PairingStatus::Revoked => {
                PairingStatus::Revoked
            }
            _ => status,
        }
    }

    /// Delete all persisted configuration, identity included, and return to
    /// `Unpaired`. Returns whether a document existed.
    pub fn forget(&self) -> Result<bool, PairingError> {
        let _exchange = self
            .exchange
            .try_lock()
            .map_err(|_| PairingError::InProgress)?;
        let removed = self.store.clear()?;
        self.transition(PairingStatus::Unpaired);
        *self.last_attempt.write() = None;
        info!(removed, "Persistent configuration cleared, agent unpaired");
        Ok(removed)
    }

    pub fn identity(&self) -> Option<AgentIdentity> {
        self.store.identity()
    }

    pub fn last_attempt(&self) -> Option<PairingAttempt> {
        self.last_attempt.read().clone()
    }

    /// One registration exchange. On success the identity is persisted and the
    /// state is `Paired`; on failure the state is `PairingFailed`.
    pub async fn pair(
        &self,
        console_url: &str,
        token: PairingToken,
        groups: BTreeSet<String>,
    ) -> Result<AgentIdentity, PairingError> {
        let _exchange = self
            .exchange
            .try_lock()
            .map_err(|_| PairingError::InProgress)?;

        let console_url = validate_console_url(console_url)?;
        if token.is_empty() {
            return Err(PairingError::InvalidRequest(
                "pairing token is empty".to_string(),
            ));
        }

        self.transition(PairingStatus::Pairing);
        let request = PairRequest {
            console_url: console_url.clone(),
            token,
            groups,
            name: self.store.settings().name,
        };
        info!(console = %console_url, groups = ?request.groups, "Pairing with console");

        let result = match self.client.pair(&request).await {
            Ok(ack) => self.complete(&request, ack),
            Err(e) => Err(PairingError::from(e)),
        };

        match result {
            Ok(identity) => {
                self.transition(PairingStatus::Paired);
                *self.last_attempt.write() = None;
                info!(
                    console = %identity.console_url,
                    agent_id = %identity.agent_id,
                    "Paired with console"
                );
                Ok(identity)
            }
            Err(e) => {
                self.transition(PairingStatus::PairingFailed);
                *self.last_attempt.write() = Some(PairingAttempt {
                    console_url,
                    groups: request.groups,
                    error: e.to_string(),
                    at: Utc::now(),
                });
                warn!(error = %e, retryable = e.is_retryable(), "Pairing failed");
                Err(e)
            }
        }
    }

    /// Retry `pair` on transport failures with the policy's backoff.
    /// Rejections and malformed responses return immediately.
    pub async fn pair_with_retry(
        &self,
        console_url: &str,
        token: PairingToken,
        groups: BTreeSet<String>,
        policy: &RetryPolicy,
    ) -> Result<AgentIdentity, PairingError> {
        let mut attempts = 0;
        loop {
            match self.pair(console_url, token.clone(), groups.clone()).await {
                Ok(identity) => return Ok(identity),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if policy.exhausted(attempts) {
                        return Err(e);
                    }
                    let delay = policy.backoff(attempts);
                    debug!(attempts, delay_ms = delay.as_millis() as u64, "Retrying pairing");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forget the pairing with `console_url` and return to `Unpaired`.
    ///
    /// Fails with [`PairingError::NoSuchPairing`] when the URL does not match
    /// the paired (or last attempted) console.
    pub async fn reset_pairing(&self, console_url: &str) -> Result<(), PairingError> {
        let _exchange = self
            .exchange
            .try_lock()
            .map_err(|_| PairingError::InProgress)?;

        if let Some(identity) = self.store.identity() {
            if identity.matches_console(console_url) {
                self.store.clear_identity()?;
                self.transition(PairingStatus::Unpaired);
                *self.last_attempt.write() = None;
                info!(console = %identity.console_url, "Console pairing reset");
                return Ok(());
            }
        } else {
            let attempted = self
                .last_attempt
                .read()
                .as_ref()
                .map(|a| normalized_eq(&a.console_url, console_url))
                .unwrap_or(false);
            if attempted {
                self.transition(PairingStatus::Unpaired);
                *self.last_attempt.write() = None;
                info!(console = %console_url, "Failed pairing attempt discarded");
                return Ok(());
            }
        }

        Err(PairingError::NoSuchPairing {
            console_url: console_url.to_string(),
        })
    }

    /// Record that the console refused this agent's credentials.
    ///
    /// Returns false when there is no paired identity, or a pairing exchange
    /// is in flight.
    pub fn mark_revoked(&self) -> Result<bool, PairingError> {
        let Ok(_exchange) = self.exchange.try_lock() else {
            return Ok(false);
        };
        match self.store.identity() {
            Some(identity) if identity.status == PairingStatus::Paired => {
                self.store.set_identity_status(PairingStatus::Revoked)?;
                self.transition(PairingStatus::Revoked);
                warn!(agent_id = %identity.agent_id, "Console revoked agent credentials");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete(&self, request: &PairRequest, ack: PairAck) -> Result<AgentIdentity, PairingError> {
        let existing = self
            .store
            .identity()
            .filter(|identity| identity.matches_console(&request.console_url));

        let agent_id = match (ack.agent_id, existing.as_ref()) {
            (Some(id), _) => id,
            (None, Some(identity)) => identity.agent_id.clone(),
            (None, None) if ack.already_registered => {
                return Err(PairingError::MalformedResponse(
                    "console reports an existing registration but returned no agent id"
                        .to_string(),
                ))
            }
            (None, None) => {
                return Err(PairingError::MalformedResponse(
                    "pairing response carried no agent id".to_string(),
                ))
            }
        };
        if ack.already_registered {
            debug!(agent_id = %agent_id, "Console reported existing registration");
        }

        let token = ack
            .access_token
            .map(PairingToken::new)
            .unwrap_or_else(|| request.token.clone());
        let identity = AgentIdentity {
            agent_id,
            console_url: request.console_url.clone(),
            pairing_token: token,
            groups: request.groups.clone(),
            paired_at: Utc::now(),
            status: PairingStatus::Paired,
        };
        self.store.save_identity(identity.clone())?;
        Ok(identity)
    }

    fn transition(&self, next: PairingStatus) {
        let mut status = self.status.write();
        let current = *status;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected pairing transition");
        }
        debug!(from = %current, to = %next, "Pairing state changed");
        *status = next;
    }
}

fn normalized_eq(a: &str, b: &str) -> bool {
    super::identity::normalize_console_url(a) == super::identity::normalize_console_url(b)
}

/// Require an absolute http(s) URL; returns it without a trailing slash.
pub fn validate_console_url(raw: &str) -> Result<String, PairingError> {
    let trimmed = raw.trim();
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| PairingError::InvalidRequest(format!("console URL '{}': {}", trimmed, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PairingError::InvalidRequest(format!(
            "console URL '{}' must be http or https",
            trimmed
        )));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}
