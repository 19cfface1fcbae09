//! Agent configuration: typed settings, the persisted document and the layered store.
//!
//! Layer precedence (lowest to highest): built-in defaults, persisted document,
//! env file, process environment, in-process overrides.

pub mod facade;
pub mod merge;
pub mod paths;
pub mod schema;
pub mod sources;
pub mod store;

use crate::pairing::identity::AgentIdentity;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub use facade::{ConfigLoader, LoadOptions, LoadedConfig};
pub use paths::AgentPaths;
pub use store::{ConfigStore, ConfigView, SetOutcome};

/// File name of the persisted configuration document.
pub const CONFIG_FILE_NAME: &str = "persistent-config.json";

/// Version written into new documents.
pub const DOCUMENT_VERSION: u32 = 1;

/// Effective, typed agent settings after all layers are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Display name sent to the console on pairing
    pub name: String,
    pub roles: Vec<String>,
    /// Per-role tables, keyed by role name
    pub role_configs: BTreeMap<String, Value>,
    /// Heartbeat cadence in seconds
    pub health_check_interval: u64,
    /// Queue drain cadence in seconds
    pub replay_interval: u64,
    pub console_timeout: u64,
    pub role_timeout: u64,
    pub shutdown_grace_period: u64,
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub ignore_tls: bool,
    pub policy_sync: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            roles: Vec::new(),
            role_configs: BTreeMap::new(),
            health_check_interval: 30,
            replay_interval: 15,
            console_timeout: 10,
            role_timeout: 60,
            shutdown_grace_period: 10,
            max_delivery_attempts: 10,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 300_000,
            ignore_tls: false,
            policy_sync: true,
        }
    }
}

fn default_agent_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "reflex-agent".to_string())
}

impl AgentSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval.max(1))
    }

    pub fn console_timeout(&self) -> Duration {
        Duration::from_secs(self.console_timeout.max(1))
    }

    pub fn role_timeout(&self) -> Duration {
        Duration::from_secs(self.role_timeout.max(1))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_delivery_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Role table for `name` (also accepted as `<name>_config`), or an empty object.
    pub fn role_config(&self, name: &str) -> Value {
        self.role_configs
            .get(name)
            .or_else(|| self.role_configs.get(&format!("{}_config", name)))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Membership check; `roles` keeps order but behaves as a set.
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r == name)
    }
}

/// Console policy revision last applied to this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub revision: u64,
    pub uuid: String,
}

/// Persisted configuration document.
///
/// `settings` is sparse: it only holds keys explicitly written through the
/// store, so defaults and outer layers stay visible for everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "document_version")]
    pub version: u32,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<AgentIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyRecord>,
}

fn document_version() -> u32 {
    DOCUMENT_VERSION
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            settings: BTreeMap::new(),
            identity: None,
            policy: None,
        }
    }
}

/// Immutable snapshot handed to readers.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub settings: AgentSettings,
    pub identity: Option<AgentIdentity>,
    pub policy: Option<PolicyRecord>,
    /// Name of the layer that supplied each key
    pub origins: BTreeMap<String, String>,
}

impl EffectiveConfig {
    pub fn origin(&self, key: &str) -> &str {
        self.origins.get(key).map(String::as_str).unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = AgentSettings::default();
        assert!(settings.roles.is_empty());
        assert_eq!(settings.health_check_interval, 30);
        assert_eq!(settings.max_delivery_attempts, 10);
        assert!(settings.policy_sync);
        assert!(!settings.ignore_tls);
        assert!(!settings.name.is_empty());
    }

    #[test]
    fn test_role_config_falls_back_to_empty_object() {
        let mut settings = AgentSettings::default();
        settings.role_configs.insert(
            "poller".to_string(),
            serde_json::json!({"wait_interval": 10}),
        );
        assert_eq!(settings.role_config("poller")["wait_interval"], 10);
        assert_eq!(settings.role_config("detector"), serde_json::json!({}));

        settings.role_configs.insert(
            "detector_config".to_string(),
            serde_json::json!({"wait_interval": 30}),
        );
        assert_eq!(settings.role_config("detector")["wait_interval"], 30);
    }

    #[test]
    fn test_document_without_version_parses() {
        let doc: ConfigDocument =
            serde_json::from_str(r#"{"settings":{"roles":["poller"]}}"#).unwrap();
        assert_eq!(doc.version, DOCUMENT_VERSION);
        assert!(doc.identity.is_none());
        assert_eq!(doc.settings["roles"], serde_json::json!(["poller"]));
    }
}
