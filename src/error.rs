//! Error types for every agent component.

use crate::types::ActionId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration document and key/value errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown setting '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid value for '{key}': '{value}' ({expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("Expected KEY:VALUE, got '{0}'")]
    Syntax(String),

    #[error("Persisted configuration {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to merge configuration sources: {0}")]
    Merge(#[from] config::ConfigError),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    #[error("Could not read env file {path}: {reason}")]
    EnvFile { path: PathBuf, reason: String },

    #[error("Could not determine platform directories: {0}")]
    Paths(String),
}

/// Transport-level failures: the console could not be reached or did not answer usefully.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Console unavailable (HTTP {status})")]
    Server { status: u16 },
}

/// Outcome classification of a single console exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Console rejected credentials (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Console returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed console response: {0}")]
    Malformed(String),
}

impl ConsoleError {
    /// Whether this failure should flip the runtime to Offline.
    pub fn is_transport(&self) -> bool {
        matches!(self, ConsoleError::Transport(_))
    }

    /// Whether the console refused this agent's credentials.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ConsoleError::Rejected { .. })
    }
}

/// Pairing failures. Transport, rejected credentials and malformed responses
/// stay distinct so the operator can decide between retrying and a new token.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Pairing failed, console unreachable: {0}")]
    Transport(TransportError),

    #[error("Pairing rejected by console (HTTP {status}): {message}. Obtain a new pairing token.")]
    Rejected { status: u16, message: String },

    #[error("Pairing failed, malformed console response: {0}")]
    MalformedResponse(String),

    #[error("Pairing failed, console returned HTTP {status}: {message}")]
    Console { status: u16, message: String },

    #[error("Another pairing operation is already in progress")]
    InProgress,

    #[error("Agent is not paired with console {console_url}")]
    NoSuchPairing { console_url: String },

    #[error("Invalid pairing request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PairingError {
    /// Retrying with the same token may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PairingError::Transport(_))
    }
}

impl From<ConsoleError> for PairingError {
    fn from(error: ConsoleError) -> Self {
        match error {
            ConsoleError::Transport(e) => PairingError::Transport(e),
            ConsoleError::Rejected { status, message } => {
                PairingError::Rejected { status, message }
            }
            ConsoleError::Status { status, message } => PairingError::Console { status, message },
            ConsoleError::Malformed(m) => PairingError::MalformedResponse(m),
        }
    }
}

/// Durable queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queued action {0} not found")]
    NotFound(ActionId),

    #[error("Queue storage error: {0}")]
    Storage(String),

    #[error("Queue record encoding error: {0}")]
    Codec(String),
}

impl From<sled::Error> for QueueError {
    fn from(error: sled::Error) -> Self {
        QueueError::Storage(error.to_string())
    }
}

impl From<bincode::Error> for QueueError {
    fn from(error: bincode::Error) -> Self {
        QueueError::Codec(error.to_string())
    }
}

/// Role activation diagnostics. Never fatal to the agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleActivationError {
    #[error("Role \"{name}\" not installed in agent library")]
    MissingDescriptor { name: String },

    #[error("Role \"{name}\" failed to initialize: {reason}")]
    Construction { name: String, reason: String },
}

impl RoleActivationError {
    pub fn role_name(&self) -> &str {
        match self {
            RoleActivationError::MissingDescriptor { name }
            | RoleActivationError::Construction { name, .. } => name,
        }
    }
}

/// Failure of a single role invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("{0}")]
    Failed(String),

    #[error("Role did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Role invocation cancelled")]
    Cancelled,
}

/// Umbrella error for the agent runtime and CLI.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error("Agent is not paired with a console. Run with --pair first.")]
    NotPaired,

    #[error("Agent pairing was revoked by the console. Re-pair with a new token.")]
    Revoked,

    #[error("Agent is running in offline mode")]
    Offline,

    #[error("Agent runtime has been shut down")]
    ShutDown,

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Invalid command line: {0}")]
    Usage(String),
}
