//! Platform directories for the agent.
//!
//! Linux: `$XDG_CONFIG_HOME/reflex-agent`, `$XDG_DATA_HOME/reflex-agent`,
//! `$XDG_STATE_HOME/reflex-agent`. Other platforms use their native locations.

use crate::error::ConfigError;
use directories::ProjectDirs;
use std::path::PathBuf;

pub fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("io", "reflexsoar", "reflex-agent").ok_or_else(|| {
        ConfigError::Paths("could not determine home directory (HOME not set)".to_string())
    })
}

/// Directory holding `persistent-config.json`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Directory holding the durable queue.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Directory for log files. Falls back to the local data directory where the
/// platform has no state directory.
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    let dirs = project_dirs()?;
    Ok(dirs
        .state_dir()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| dirs.data_local_dir().to_path_buf()))
}
