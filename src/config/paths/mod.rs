//! On-disk locations of the config document and queue store.

pub mod xdg_root;

use crate::config::CONFIG_FILE_NAME;
use crate::error::ConfigError;
use std::path::{Path, PathBuf};

const QUEUE_DIR_NAME: &str = "queue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub config_file: PathBuf,
    pub queue_dir: PathBuf,
}

impl AgentPaths {
    /// Platform locations, or everything under `config_path` when given.
    pub fn resolve(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(dir) => Ok(Self::in_dir(dir)),
            None => Ok(Self {
                config_file: xdg_root::config_dir()?.join(CONFIG_FILE_NAME),
                queue_dir: xdg_root::data_dir()?.join(QUEUE_DIR_NAME),
            }),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config_file: dir.join(CONFIG_FILE_NAME),
            queue_dir: dir.join(QUEUE_DIR_NAME),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![self.queue_dir.as_path()];
        if let Some(parent) = self.config_file.parent() {
            dirs.push(parent);
        }
        for dir in dirs {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
