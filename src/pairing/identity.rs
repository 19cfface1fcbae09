//! Agent identity and pairing status types.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Pairing lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingStatus {
    Unpaired,
    Pairing,
    Paired,
    PairingFailed,
    Revoked,
}

impl PairingStatus {
    /// Allowed state machine edges.
    ///
    /// `Revoked` and `PairingFailed` are recoverable: both may start a new
    /// pairing exchange or fall back to `Unpaired`.
    pub fn can_transition_to(self, next: PairingStatus) -> bool {
        use PairingStatus::*;
        matches!(
            (self, next),
            (Unpaired, Pairing)
                | (Pairing, Paired)
                | (Pairing, PairingFailed)
                | (Paired, Pairing)
                | (Paired, Revoked)
                | (Paired, Unpaired)
                | (PairingFailed, Pairing)
                | (PairingFailed, Unpaired)
                | (Revoked, Pairing)
                | (Revoked, Unpaired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairingStatus::Unpaired => "unpaired",
            PairingStatus::Pairing => "pairing",
            PairingStatus::Paired => "paired",
            PairingStatus::PairingFailed => "pairing-failed",
            PairingStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Console credential. Never printed in full.
#[derive(Clone)]
pub struct PairingToken(SecretString);

impl PairingToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().trim().is_empty()
    }

    /// First four characters followed by a fixed mask; short tokens are fully masked.
    pub fn masked(&self) -> String {
        let token = self.expose();
        if token.chars().count() <= 8 {
            return "********".to_string();
        }
        let prefix: String = token.chars().take(4).collect();
        format!("{}********", prefix)
    }
}

impl fmt::Debug for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingToken({})", self.masked())
    }
}

impl fmt::Display for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl PartialEq for PairingToken {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Serialize for PairingToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for PairingToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PairingToken::new(raw))
    }
}

/// This installation's registration with one console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Opaque id assigned by the console
    pub agent_id: String,
    pub console_url: String,
    pub pairing_token: PairingToken,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub paired_at: DateTime<Utc>,
    pub status: PairingStatus,
}

impl AgentIdentity {
    pub fn is_paired(&self) -> bool {
        self.status == PairingStatus::Paired
    }

    /// Whether this identity belongs to the given console URL (trailing slashes ignored).
    pub fn matches_console(&self, console_url: &str) -> bool {
        normalize_console_url(&self.console_url) == normalize_console_url(console_url)
    }
}

/// Canonical textual form used to compare console URLs.
pub fn normalize_console_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}
