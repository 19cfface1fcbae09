//! reqwest implementation of [`ConsoleClient`].

use super::{endpoint_for, join_url, AgentPolicy, ConsoleClient, HeartbeatBody, PairAck, PairRequest};
use crate::config::{AgentSettings, ConfigStore};
use crate::error::{ConsoleError, TransportError};
use crate::pairing::identity::AgentIdentity;
use crate::queue::ActionKind;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Pairing response. Consoles differ in the id field name.
#[derive(Debug, Default, Deserialize)]
struct PairResponse {
    #[serde(alias = "agentId", alias = "uuid")]
    agent_id: Option<String>,
    access_token: Option<String>,
}

/// Transport knobs a built `reqwest::Client` is fixed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransportSettings {
    timeout: Duration,
    ignore_tls: bool,
}

impl TransportSettings {
    fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            timeout: settings.console_timeout(),
            ignore_tls: settings.ignore_tls,
        }
    }

    fn build(self) -> Result<Client, ConsoleError> {
        Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.ignore_tls)
            .user_agent(format!("reflex-agent/{}", crate::VERSION))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()).into())
    }
}

pub struct HttpConsoleClient {
    transport: RwLock<(TransportSettings, Client)>,
    /// When set, `console_timeout` and `ignore_tls` are re-read before each request
    store: Option<Arc<ConfigStore>>,
}

impl HttpConsoleClient {
    /// Client with fixed transport settings.
    pub fn new(timeout: Duration, ignore_tls: bool) -> Result<Self, ConsoleError> {
        let knobs = TransportSettings { timeout, ignore_tls };
        Ok(Self {
            transport: RwLock::new((knobs, knobs.build()?)),
            store: None,
        })
    }

    pub fn from_settings(settings: &AgentSettings) -> Result<Self, ConsoleError> {
        Self::new(settings.console_timeout(), settings.ignore_tls)
    }

    /// Client that follows the store: a committed change to `console_timeout`
    /// or `ignore_tls` rebuilds the underlying client on the next request.
    pub fn for_store(store: Arc<ConfigStore>) -> Result<Self, ConsoleError> {
        let knobs = TransportSettings::from_settings(&store.snapshot().settings);
        Ok(Self {
            transport: RwLock::new((knobs, knobs.build()?)),
            store: Some(store),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.transport.read().0.timeout
    }

    pub fn ignores_tls(&self) -> bool {
        self.transport.read().0.ignore_tls
    }

    /// Rebuild the client if `settings` differ from what it was built with.
    /// Returns whether a rebuild happened.
    pub fn reconfigure(&self, settings: &AgentSettings) -> Result<bool, ConsoleError> {
        let wanted = TransportSettings::from_settings(settings);
        if self.transport.read().0 == wanted {
            return Ok(false);
        }
        let client = wanted.build()?;
        *self.transport.write() = (wanted, client);
        debug!(
            timeout_secs = wanted.timeout.as_secs(),
            ignore_tls = wanted.ignore_tls,
            "Console client rebuilt"
        );
        Ok(true)
    }

    /// Current client, rebuilt first when the followed store has moved on.
    fn client(&self) -> Result<Client, ConsoleError> {
        if let Some(store) = &self.store {
            self.reconfigure(&store.snapshot().settings)?;
        }
        Ok(self.transport.read().1.clone())
    }

    fn authorized(&self, builder: RequestBuilder, identity: &AgentIdentity) -> RequestBuilder {
        builder.bearer_auth(identity.pairing_token.expose())
    }

    /// Send and map failures: transport errors and 5xx to `Transport`,
    /// 401/403 to `Rejected`, other non-2xx to `Status`.
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ConsoleError> {
        let response = builder.send().await.map_err(|e| self.transport(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify(status, message))
    }

    fn transport(&self, error: reqwest::Error) -> ConsoleError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout()).into()
        } else if error.is_connect() {
            TransportError::Connect(error.to_string()).into()
        } else {
            TransportError::Request(error.to_string()).into()
        }
    }

    async fn read_body(&self, response: Response) -> Result<Vec<u8>, ConsoleError> {
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| self.transport(e))
    }
}

fn classify(status: StatusCode, message: String) -> ConsoleError {
    let code = status.as_u16();
    let message = truncate(message.trim());
    match code {
        401 | 403 => ConsoleError::Rejected {
            status: code,
            message,
        },
        500..=599 => TransportError::Server { status: code }.into(),
        _ => ConsoleError::Status {
            status: code,
            message,
        },
    }
}

fn truncate(message: &str) -> String {
    const LIMIT: usize = 200;
    if message.chars().count() <= LIMIT {
        message.to_string()
    } else {
        let cut: String = message.chars().take(LIMIT).collect();
        format!("{}...", cut)
    }
}

fn parse_pair_body(body: &[u8]) -> Result<PairResponse, ConsoleError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(PairResponse::default());
    }
    serde_json::from_slice(body).map_err(|e| ConsoleError::Malformed(e.to_string()))
}

#[async_trait]
impl ConsoleClient for HttpConsoleClient {
    async fn pair(&self, request: &PairRequest) -> Result<PairAck, ConsoleError> {
        let url = join_url(&request.console_url, "pair");
        let body = serde_json::json!({
            "token": request.token.expose(),
            "groups": request.groups,
            "name": request.name,
        });
        debug!(url = %url, groups = request.groups.len(), "Sending pairing request");

        let response = self
            .client()?
            .post(&url)
            .bearer_auth(request.token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let bytes = self.read_body(response).await?;
            let parsed = parse_pair_body(&bytes).unwrap_or_default();
            return Ok(PairAck {
                agent_id: parsed.agent_id,
                access_token: parsed.access_token,
                already_registered: true,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify(status, message));
        }

        let bytes = self.read_body(response).await?;
        let parsed = parse_pair_body(&bytes)?;
        Ok(PairAck {
            agent_id: parsed.agent_id.filter(|id| !id.trim().is_empty()),
            access_token: parsed.access_token.filter(|t| !t.trim().is_empty()),
            already_registered: false,
        })
    }

    async fn heartbeat(
        &self,
        identity: &AgentIdentity,
        body: &HeartbeatBody,
    ) -> Result<(), ConsoleError> {
        let url = join_url(
            &identity.console_url,
            &format!("agents/{}/heartbeat", identity.agent_id),
        );
        let builder = self.authorized(self.client()?.post(&url), identity).json(body);
        self.send(builder).await?;
        Ok(())
    }

    async fn deliver(
        &self,
        identity: &AgentIdentity,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(), ConsoleError> {
        let url = join_url(&identity.console_url, &endpoint_for(kind, &identity.agent_id));
        let builder = self
            .authorized(self.client()?.post(&url), identity)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec());
        self.send(builder).await?;
        Ok(())
    }

    async fn fetch_policy(
        &self,
        identity: &AgentIdentity,
    ) -> Result<Option<AgentPolicy>, ConsoleError> {
        let url = join_url(
            &identity.console_url,
            &format!("agents/{}/policy", identity.agent_id),
        );
        let builder = self.authorized(self.client()?.get(&url), identity);
        let response = match self.send(builder).await {
            Ok(response) => response,
            Err(ConsoleError::Status { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let bytes = self.read_body(response).await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ConsoleError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        assert!(classify(StatusCode::UNAUTHORIZED, String::new()).is_rejection());
        assert!(classify(StatusCode::FORBIDDEN, String::new()).is_rejection());
        assert!(classify(StatusCode::BAD_GATEWAY, String::new()).is_transport());
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, "bad".to_string()),
            ConsoleError::Status {
                status: 400,
                message: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_pair_body_aliases() {
        let parsed = parse_pair_body(br#"{"uuid":"a-1","access_token":"t"}"#).unwrap();
        assert_eq!(parsed.agent_id.as_deref(), Some("a-1"));
        assert_eq!(parsed.access_token.as_deref(), Some("t"));
        let parsed = parse_pair_body(br#"{"agentId":"a-2"}"#).unwrap();
        assert_eq!(parsed.agent_id.as_deref(), Some("a-2"));
        assert!(parse_pair_body(b"  ").unwrap().agent_id.is_none());
        assert!(matches!(
            parse_pair_body(b"<html>"),
            Err(ConsoleError::Malformed(_))
        ));
    }

    #[test]
    fn test_reconfigure_rebuilds_only_on_change() {
        let client = HttpConsoleClient::new(Duration::from_secs(10), false).unwrap();
        let mut settings = AgentSettings::default();
        assert!(!client.reconfigure(&settings).unwrap());

        settings.console_timeout = 3;
        settings.ignore_tls = true;
        assert!(client.reconfigure(&settings).unwrap());
        assert_eq!(client.timeout(), Duration::from_secs(3));
        assert!(client.ignores_tls());
        assert!(!client.reconfigure(&settings).unwrap());
    }

    #[test]
    fn test_store_backed_client_follows_committed_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("agent.json"), Vec::new()).unwrap());
        let client = HttpConsoleClient::for_store(Arc::clone(&store)).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(10));

        store.set("console_timeout", "2").unwrap();
        store.set("ignore_tls", "true").unwrap();
        client.client().unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(2));
        assert!(client.ignores_tls());
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long).len(), 203);
    }
}
