//! Structured logging setup.
//!
//! Settings come from defaults, then `REFLEX_AGENT_LOG*` environment
//! variables, then command line flags. Events carry structured fields; the
//! pairing token only ever appears masked.

use crate::config::paths::xdg_root;
use crate::error::AgentError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "REFLEX_AGENT_LOG";
pub const LOG_FORMAT_ENV: &str = "REFLEX_AGENT_LOG_FORMAT";
pub const LOG_OUTPUT_ENV: &str = "REFLEX_AGENT_LOG_OUTPUT";
pub const LOG_FILE_ENV: &str = "REFLEX_AGENT_LOG_FILE";
pub const LOG_MODULES_ENV: &str = "REFLEX_AGENT_LOG_MODULES";

const LOG_FILE_NAME: &str = "reflex-agent.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(AgentError::Logging(format!(
                "invalid log format '{}' (expected text or json)",
                other
            ))),
        }
    }
}

/// Where events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOutput {
    pub stdout: bool,
    pub stderr: bool,
    pub file: bool,
}

impl FromStr for LogOutput {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stdout, stderr, file) = match s.trim().to_ascii_lowercase().as_str() {
            "stdout" => (true, false, false),
            "stderr" => (false, true, false),
            "file" => (false, false, true),
            "file+stderr" => (false, true, true),
            "both" => (true, true, false),
            other => {
                return Err(AgentError::Logging(format!(
                    "invalid log output '{}' (expected stdout, stderr, file, file+stderr or both)",
                    other
                )))
            }
        };
        Ok(LogOutput {
            stdout,
            stderr,
            file,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Level or full filter directive, e.g. `info` or `warn,reflex_agent::runtime=debug`
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Log file; the platform state directory when unset
    pub file: Option<PathBuf>,
    /// ANSI colors for text output on a terminal stream
    pub color: bool,
    /// Per-module levels
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Text,
            output: LogOutput {
                stdout: false,
                stderr: false,
                file: true,
            },
            file: None,
            color: true,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Defaults overlaid with the `REFLEX_AGENT_LOG*` process variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(level) = present(LOG_ENV) {
            config.level = level.trim().to_string();
        }
        if let Some(format) = present(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        if let Some(output) = present(LOG_OUTPUT_ENV) {
            config.output = output.parse()?;
        }
        if let Some(file) = present(LOG_FILE_ENV) {
            config.file = Some(PathBuf::from(file));
        }
        if let Some(modules) = present(LOG_MODULES_ENV) {
            for spec in modules.split(',') {
                if let Some((module, level)) = spec.split_once('=') {
                    config
                        .modules
                        .insert(module.trim().to_string(), level.trim().to_string());
                }
            }
        }
        if config.level.eq_ignore_ascii_case("off") {
            config.enabled = false;
        }
        Ok(config)
    }

    pub fn log_file(&self) -> Result<PathBuf, AgentError> {
        match &self.file {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => default_log_file(),
        }
    }

    fn filter(&self) -> Result<EnvFilter, AgentError> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| AgentError::Logging(format!("invalid log level '{}': {}", self.level, e)))?;
        for (module, level) in &self.modules {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(directive.parse().map_err(|e| {
                AgentError::Logging(format!("invalid log directive '{}': {}", directive, e))
            })?);
        }
        Ok(filter)
    }

    fn writer(&self) -> Result<BoxMakeWriter, AgentError> {
        let output = self.output;
        if output.file {
            let file = Mutex::new(open_log_file(&self.log_file()?)?);
            return Ok(if output.stderr {
                BoxMakeWriter::new(file.and(std::io::stderr))
            } else {
                BoxMakeWriter::new(file)
            });
        }
        Ok(match (output.stdout, output.stderr) {
            (true, true) => BoxMakeWriter::new(std::io::stdout.and(std::io::stderr)),
            (false, true) => BoxMakeWriter::new(std::io::stderr),
            _ => BoxMakeWriter::new(std::io::stdout),
        })
    }
}

/// `<state_dir>/reflex-agent.log`.
pub fn default_log_file() -> Result<PathBuf, AgentError> {
    xdg_root::state_dir()
        .map(|dir| dir.join(LOG_FILE_NAME))
        .map_err(|e| AgentError::Logging(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<std::fs::File, AgentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AgentError::Logging(format!("failed to create log directory {:?}: {}", parent, e))
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AgentError::Logging(format!("failed to open log file {:?}: {}", path, e)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), AgentError> {
    if !config.enabled {
        return Registry::default()
            .with(EnvFilter::new("off"))
            .try_init()
            .map_err(|e| AgentError::Logging(e.to_string()));
    }

    let filter = config.filter()?;
    let writer = config.writer()?;
    let ansi = config.color && !config.output.file;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    };

    Registry::default()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| AgentError::Logging(e.to_string()))
}
