//! Operator tooling: the command line surface over the agent core.

pub mod cli;

pub use cli::{Cli, CliContext, Command, OutputFormat};
