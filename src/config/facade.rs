//! ConfigLoader facade: resolves paths, reads the env file and opens the store.

use super::paths::AgentPaths;
use super::sources::environment::{self, EnvFile};
use super::store::ConfigStore;
use crate::error::ConfigError;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Directory replacing the platform config and data locations
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Read `REFLEX_AGENT_*` process variables
    pub read_environment: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            env_file: None,
            read_environment: true,
        }
    }
}

pub struct LoadedConfig {
    pub store: Arc<ConfigStore>,
    pub paths: AgentPaths,
    pub env_file: Option<EnvFile>,
}

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Layers: defaults, persisted document, env file, environment, overrides.
    pub fn open(options: &LoadOptions) -> Result<LoadedConfig, ConfigError> {
        let paths = AgentPaths::resolve(options.config_path.as_deref())?;
        paths.ensure_dirs()?;

        let env_file = options
            .env_file
            .as_deref()
            .map(EnvFile::load)
            .transpose()?;

        let mut base_layers = Vec::new();
        if let Some(file) = &env_file {
            base_layers.push(file.layer());
        }
        if options.read_environment {
            base_layers.push(environment::process_environment());
        }

        let store = ConfigStore::open(paths.config_file.clone(), base_layers)?;
        Ok(LoadedConfig {
            store: Arc::new(store),
            paths,
            env_file,
        })
    }
}
