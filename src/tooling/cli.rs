//! CLI Tooling
//!
//! Flag-style command line. Flags are turned into an ordered list of
//! [`Command`]s; each command maps to one config store, pairing or runtime
//! call and renders its result as text or JSON.

use crate::config::sources::environment::{resolve_var, EnvFile};
use crate::config::{AgentPaths, ConfigLoader, ConfigStore, LoadOptions, LoadedConfig};
use crate::console::{ConsoleClient, HttpConsoleClient};
use crate::error::AgentError;
use crate::logging::{LogFormat, LogOutput, LoggingConfig};
use crate::pairing::{PairingMachine, PairingToken};
use crate::queue::{DurableQueue, QueuedAction};
use crate::role::{RoleRegistry, Submission};
use crate::runtime::{AgentRuntime, CycleReport, HeartbeatOutcome, RuntimeOptions};
use clap::{Parser, ValueEnum};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

pub const CONSOLE_ENV: &str = "REFLEX_API_HOST";
pub const PAIR_TOKEN_ENV: &str = "REFLEX_AGENT_PAIR_TOKEN";
pub const PAIR_MODE_ENV: &str = "REFLEX_AGENT_PAIR_MODE";

/// Reflex agent - pair with a console, heartbeat and run roles
#[derive(Parser, Debug)]
#[command(name = "reflex-agent")]
#[command(version)]
#[command(about = "Endpoint agent for the Reflex management console")]
pub struct Cli {
    /// Pair this agent with the console given by --console
    #[arg(long)]
    pub pair: bool,

    /// Exit after pairing instead of starting the agent
    #[arg(long)]
    pub pair_skip_start: bool,

    /// Run the agent until interrupted
    #[arg(long)]
    pub start: bool,

    /// Console URL
    #[arg(long, env = CONSOLE_ENV, value_name = "URL")]
    pub console: Option<String>,

    /// Pairing token issued by the console
    #[arg(long, env = PAIR_TOKEN_ENV, hide_env_values = true, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Groups to join when pairing
    #[arg(long, value_delimiter = ',', value_name = "CSV")]
    pub groups: Vec<String>,

    /// Delete the persisted configuration, identity and queue
    #[arg(long)]
    pub clear_persistent_config: bool,

    /// Forget the pairing with the given console
    #[arg(long, value_name = "CONSOLE_URL")]
    pub reset_console_pairing: Option<String>,

    /// Print the effective configuration
    #[arg(long)]
    pub view_config: bool,

    /// Persist a setting, e.g. `roles:poller,detector` (repeatable)
    #[arg(long, value_name = "KEY:VALUE")]
    pub set_config_value: Vec<String>,

    /// Environment file layered over the persisted configuration
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Send one heartbeat and exit
    #[arg(long)]
    pub heartbeat: bool,

    /// Never contact the console; actions stay queued. Alone, runs one cycle.
    #[arg(long)]
    pub offline: bool,

    /// Print queue depth and dead-lettered actions
    #[arg(long)]
    pub queue_status: bool,

    /// Directory holding the configuration document and queue
    #[arg(long, value_name = "DIR")]
    pub config_path: Option<PathBuf>,

    /// Output format for --view-config and --queue-status
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Log level or filter directive (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// One operator request, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ClearPersistentConfig,
    ResetConsolePairing {
        console_url: String,
    },
    SetConfigValue {
        assignment: String,
    },
    Pair {
        console_url: String,
        token: PairingToken,
        groups: BTreeSet<String>,
    },
    ViewConfig {
        format: OutputFormat,
    },
    QueueStatus {
        format: OutputFormat,
    },
    Heartbeat {
        offline: bool,
    },
    /// One runtime cycle without contacting the console
    RunOnce,
    Start {
        offline: bool,
    },
}

impl Cli {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config_path.clone(),
            env_file: self.env_file.clone(),
            read_environment: true,
        }
    }

    /// Environment logging settings with command line flags on top.
    pub fn logging_config(&self) -> Result<LoggingConfig, AgentError> {
        let mut config = LoggingConfig::from_env()?;
        if let Some(level) = &self.log_level {
            config.level = level.clone();
            config.enabled = !level.eq_ignore_ascii_case("off");
        }
        if let Some(format) = &self.log_format {
            config.format = format.parse::<LogFormat>()?;
        }
        if let Some(output) = &self.log_output {
            config.output = output.parse::<LogOutput>()?;
        }
        if let Some(file) = &self.log_file {
            config.file = Some(file.clone());
        }
        Ok(config)
    }

    /// Resolve flags into commands. `--console`, `--token` and pair mode fall
    /// back to the env file when the process environment has no value.
    pub fn commands(&self, env_file: Option<&EnvFile>) -> Result<Vec<Command>, AgentError> {
        let mut commands = Vec::new();
        if self.clear_persistent_config {
            commands.push(Command::ClearPersistentConfig);
        }
        if let Some(console_url) = &self.reset_console_pairing {
            commands.push(Command::ResetConsolePairing {
                console_url: console_url.clone(),
            });
        }
        for assignment in &self.set_config_value {
            commands.push(Command::SetConfigValue {
                assignment: assignment.clone(),
            });
        }

        let pair_mode = resolve_var(PAIR_MODE_ENV, env_file)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let pairing = self.pair || pair_mode;
        if pairing {
            let console_url = self
                .console
                .clone()
                .or_else(|| resolve_var(CONSOLE_ENV, env_file))
                .ok_or_else(|| {
                    AgentError::Usage(format!("--pair requires --console or {}", CONSOLE_ENV))
                })?;
            let token = self
                .token
                .clone()
                .or_else(|| resolve_var(PAIR_TOKEN_ENV, env_file))
                .ok_or_else(|| {
                    AgentError::Usage(format!("--pair requires --token or {}", PAIR_TOKEN_ENV))
                })?;
            let groups = self
                .groups
                .iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
            commands.push(Command::Pair {
                console_url,
                token: PairingToken::new(token),
                groups,
            });
        } else if self.pair_skip_start {
            return Err(AgentError::Usage(
                "--pair-skip-start only applies together with --pair".to_string(),
            ));
        }

        if self.view_config {
            commands.push(Command::ViewConfig {
                format: self.format,
            });
        }
        if self.queue_status {
            commands.push(Command::QueueStatus {
                format: self.format,
            });
        }
        if self.heartbeat {
            commands.push(Command::Heartbeat {
                offline: self.offline,
            });
        }

        let start = self.start || (pairing && !self.pair_skip_start);
        if start {
            commands.push(Command::Start {
                offline: self.offline,
            });
        } else if self.offline {
            commands.push(Command::RunOnce);
        }

        if commands.is_empty() {
            return Err(AgentError::Usage(
                "nothing to do; see --help for the available actions".to_string(),
            ));
        }
        Ok(commands)
    }
}

/// CLI context holding the opened configuration and console client.
pub struct CliContext {
    store: Arc<ConfigStore>,
    paths: AgentPaths,
    env_file: Option<EnvFile>,
    client: Arc<dyn ConsoleClient>,
    pairing: Arc<PairingMachine>,
    /// Opened on first use so read-only commands never touch the queue store
    queue: Mutex<Option<Arc<DurableQueue>>>,
}

impl CliContext {
    /// Open configuration per `options` and build an HTTP console client
    /// that follows later `--set-config-value` changes.
    pub fn new(options: &LoadOptions) -> Result<Self, AgentError> {
        let loaded = ConfigLoader::open(options)?;
        let client = HttpConsoleClient::for_store(Arc::clone(&loaded.store))?;
        Ok(Self::with_client(loaded, Arc::new(client)))
    }

    pub fn with_client(loaded: LoadedConfig, client: Arc<dyn ConsoleClient>) -> Self {
        let pairing = Arc::new(PairingMachine::new(
            Arc::clone(&loaded.store),
            Arc::clone(&client),
        ));
        Self {
            store: loaded.store,
            paths: loaded.paths,
            env_file: loaded.env_file,
            client,
            pairing,
            queue: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn env_file(&self) -> Option<&EnvFile> {
        self.env_file.as_ref()
    }

    pub fn pairing(&self) -> &Arc<PairingMachine> {
        &self.pairing
    }

    pub fn queue(&self) -> Result<Arc<DurableQueue>, AgentError> {
        let mut slot = self.queue.lock();
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let max_attempts = self.store.settings().max_delivery_attempts;
        let queue = Arc::new(DurableQueue::open(&self.paths.queue_dir, max_attempts)?);
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    fn runtime(&self, offline: bool) -> Result<AgentRuntime, AgentError> {
        let options = if offline {
            RuntimeOptions::offline()
        } else {
            RuntimeOptions::default()
        };
        Ok(AgentRuntime::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pairing),
            Arc::clone(&self.client),
            self.queue()?,
            RoleRegistry::builtin(),
            options,
        ))
    }

    /// Execute one command and return its rendered output.
    pub async fn execute(&self, command: &Command) -> Result<String, AgentError> {
        match command {
            Command::ClearPersistentConfig => {
                let removed = self.pairing.forget()?;
                self.queue()?.clear()?;
                Ok(if removed {
                    format!(
                        "Cleared persistent configuration at {}",
                        self.store.path().display()
                    )
                } else {
                    "No persistent configuration to clear".to_string()
                })
            }
            Command::ResetConsolePairing { console_url } => {
                self.pairing.reset_pairing(console_url).await?;
                Ok(format!("Pairing with {} reset", console_url))
            }
            Command::SetConfigValue { assignment } => {
                let outcome = self.store.set_assignment(assignment)?;
                let value = render_value(&outcome.value);
                Ok(if outcome.changed {
                    format!("Set {} = {}", outcome.key, value)
                } else {
                    format!("{} already set to {}", outcome.key, value)
                })
            }
            Command::Pair {
                console_url,
                token,
                groups,
            } => {
                let identity = self
                    .pairing
                    .pair(console_url, token.clone(), groups.clone())
                    .await?;
                Ok(format!(
                    "Paired with {} as agent {}",
                    identity.console_url, identity.agent_id
                ))
            }
            Command::ViewConfig { format } => {
                let view = self.store.view();
                Ok(match format {
                    OutputFormat::Text => view.render_table(),
                    OutputFormat::Json => to_pretty(&view.to_json()),
                })
            }
            Command::QueueStatus { format } => self.queue_status(*format),
            Command::Heartbeat { offline } => {
                let outcome = self.runtime(*offline)?.heartbeat_once().await?;
                Ok(match outcome {
                    HeartbeatOutcome::Delivered { policy_changed } => {
                        if policy_changed {
                            "Heartbeat delivered; console policy applied".to_string()
                        } else {
                            "Heartbeat delivered".to_string()
                        }
                    }
                    HeartbeatOutcome::Deferred(Submission::Queued(id)) => {
                        format!("Console not contacted; heartbeat queued as action {}", id)
                    }
                    HeartbeatOutcome::Deferred(_) => {
                        "Console not contacted; a heartbeat is already queued".to_string()
                    }
                })
            }
            Command::RunOnce => {
                let report = self.runtime(true)?.run_cycle().await?;
                Ok(format_cycle(&report))
            }
            Command::Start { offline } => self.run_agent(*offline, shutdown_signal()).await,
        }
    }

    /// Run the agent until `signal` resolves.
    pub async fn run_agent<F>(&self, offline: bool, signal: F) -> Result<String, AgentError>
    where
        F: Future<Output = ()>,
    {
        let runtime = self.runtime(offline)?;
        info!(
            agent = %self.store.settings().name,
            version = crate::VERSION,
            offline,
            "Starting agent"
        );
        runtime.run_until(signal).await?;
        Ok(format!(
            "Agent stopped ({} actions queued)",
            runtime.queue().len()
        ))
    }

    fn queue_status(&self, format: OutputFormat) -> Result<String, AgentError> {
        let queue = self.queue()?;
        let pending = queue.pending()?;
        let dead = queue.dead_letters()?;

        if format == OutputFormat::Json {
            let head = pending.first().map(action_json);
            let dead: Vec<_> = dead
                .iter()
                .map(|d| {
                    let mut value = action_json(&d.action);
                    value["dead_lettered_at"] = json!(d.dead_lettered_at.to_rfc3339());
                    value
                })
                .collect();
            return Ok(to_pretty(&json!({
                "depth": pending.len(),
                "max_attempts": queue.max_attempts(),
                "head": head,
                "dead_letters": dead,
            })));
        }

        let mut output = format!("Pending actions: {}\n", pending.len());
        if let Some(head) = pending.first() {
            output.push_str(&format!(
                "Head: #{} {} (attempts {}, queued {})\n",
                head.id,
                head.kind,
                head.attempts,
                head.enqueued_at.to_rfc3339()
            ));
        }
        if dead.is_empty() {
            output.push_str("Dead letters: none");
            return Ok(output);
        }
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Id", "Kind", "Attempts", "Last error", "Dead-lettered"]);
        for letter in &dead {
            table.add_row(vec![
                letter.action.id.to_string(),
                letter.action.kind.to_string(),
                letter.action.attempts.to_string(),
                letter.action.last_error.clone().unwrap_or_default(),
                letter.dead_lettered_at.to_rfc3339(),
            ]);
        }
        output.push_str(&format!("Dead letters: {}\n", dead.len()));
        output.push_str(&table.to_string());
        Ok(output)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for interrupt, shutting down");
    }
}

fn action_json(action: &QueuedAction) -> serde_json::Value {
    json!({
        "id": action.id.0,
        "kind": action.kind.as_str(),
        "attempts": action.attempts,
        "enqueued_at": action.enqueued_at.to_rfc3339(),
        "last_error": action.last_error,
    })
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn format_cycle(report: &CycleReport) -> String {
    let mut lines = vec![format!(
        "Ran {} role(s) offline; {} action(s) queued",
        report.roles_run.len(),
        report.queue_depth
    )];
    for (role, error) in &report.role_failures {
        lines.push(format!("Role {} failed: {}", role, error));
    }
    lines.join("\n")
}
