//! In-process console used by unit tests.

use super::{AgentPolicy, ConsoleClient, HeartbeatBody, PairAck, PairRequest};
use crate::error::{ConsoleError, TransportError};
use crate::pairing::identity::AgentIdentity;
use crate::queue::ActionKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct FakeConsole {
    reachable: AtomicBool,
    revoked: AtomicBool,
    /// Non-2xx status returned by every authenticated call
    refusal: Mutex<Option<u16>>,
    valid_token: String,
    registered: Mutex<Option<String>>,
    pub pair_calls: AtomicUsize,
    pub deliveries: Mutex<Vec<(ActionKind, Value)>>,
    pub heartbeats: Mutex<Vec<HeartbeatBody>>,
    pub policy: Mutex<Option<AgentPolicy>>,
    /// Delay applied to pairing, to hold the exchange open
    pub pair_delay: Mutex<Duration>,
}

impl FakeConsole {
    pub fn new(valid_token: &str) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            revoked: AtomicBool::new(false),
            refusal: Mutex::new(None),
            valid_token: valid_token.to_string(),
            registered: Mutex::new(None),
            pair_calls: AtomicUsize::new(0),
            deliveries: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
            policy: Mutex::new(None),
            pair_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_revoked(&self, revoked: bool) {
        self.revoked.store(revoked, Ordering::SeqCst);
    }

    pub fn set_refusal(&self, status: Option<u16>) {
        *self.refusal.lock() = status;
    }

    fn check(&self) -> Result<(), ConsoleError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()).into());
        }
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ConsoleError::Rejected {
                status: 401,
                message: "agent revoked".to_string(),
            });
        }
        if let Some(status) = *self.refusal.lock() {
            return Err(ConsoleError::Status {
                status,
                message: "unknown agent".to_string(),
            });
        }
        Ok(())
    }

    pub fn delivered_payloads(&self, kind: ActionKind) -> Vec<Value> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl ConsoleClient for FakeConsole {
    async fn pair(&self, request: &PairRequest) -> Result<PairAck, ConsoleError> {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pair_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()).into());
        }
        if request.token.expose() != self.valid_token {
            return Err(ConsoleError::Rejected {
                status: 401,
                message: "invalid pairing token".to_string(),
            });
        }
        let mut registered = self.registered.lock();
        if registered.is_some() {
            return Ok(PairAck {
                agent_id: None,
                access_token: None,
                already_registered: true,
            });
        }
        let id = "agent-0001".to_string();
        *registered = Some(id.clone());
        Ok(PairAck {
            agent_id: Some(id),
            access_token: Some("access-token-0001".to_string()),
            already_registered: false,
        })
    }

    async fn heartbeat(
        &self,
        _identity: &AgentIdentity,
        body: &HeartbeatBody,
    ) -> Result<(), ConsoleError> {
        self.check()?;
        self.heartbeats.lock().push(body.clone());
        Ok(())
    }

    async fn deliver(
        &self,
        _identity: &AgentIdentity,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(), ConsoleError> {
        self.check()?;
        let payload: Value =
            serde_json::from_slice(payload).map_err(|e| ConsoleError::Malformed(e.to_string()))?;
        self.deliveries.lock().push((kind, payload));
        Ok(())
    }

    async fn fetch_policy(
        &self,
        _identity: &AgentIdentity,
    ) -> Result<Option<AgentPolicy>, ConsoleError> {
        self.check()?;
        Ok(self.policy.lock().clone())
    }
}
