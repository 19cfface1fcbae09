//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::Utc;
use reflex_agent::config::{ConfigLoader, LoadOptions, LoadedConfig};
use reflex_agent::console::HttpConsoleClient;
use reflex_agent::pairing::{AgentIdentity, PairingMachine, PairingStatus, PairingToken};
use reflex_agent::queue::DurableQueue;
use reflex_agent::role::RoleRegistry;
use reflex_agent::runtime::{AgentRuntime, RuntimeOptions};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const AGENT_ID: &str = "agent-7";
pub const TOKEN: &str = "pair-token-0001";

/// Open configuration under `dir` without reading process variables.
pub fn load(dir: &TempDir) -> LoadedConfig {
    ConfigLoader::open(&LoadOptions {
        config_path: Some(dir.path().to_path_buf()),
        env_file: None,
        read_environment: false,
    })
    .unwrap()
}

pub fn http_client() -> Arc<HttpConsoleClient> {
    Arc::new(HttpConsoleClient::new(Duration::from_secs(5), false).unwrap())
}

pub fn paired_identity(console_url: &str) -> AgentIdentity {
    AgentIdentity {
        agent_id: AGENT_ID.to_string(),
        console_url: console_url.to_string(),
        pairing_token: PairingToken::new(TOKEN),
        groups: BTreeSet::new(),
        paired_at: Utc::now(),
        status: PairingStatus::Paired,
    }
}

/// Runtime over `loaded` with the built-in roles and an HTTP console client.
pub fn runtime(loaded: &LoadedConfig, options: RuntimeOptions) -> AgentRuntime {
    let client = http_client();
    let pairing = Arc::new(PairingMachine::new(
        Arc::clone(&loaded.store),
        client.clone(),
    ));
    let settings = loaded.store.settings();
    let queue =
        Arc::new(DurableQueue::open(&loaded.paths.queue_dir, settings.max_delivery_attempts).unwrap());
    AgentRuntime::new(
        Arc::clone(&loaded.store),
        pairing,
        client,
        queue,
        RoleRegistry::builtin(),
        options,
    )
}
