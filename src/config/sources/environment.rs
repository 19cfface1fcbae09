//! Environment sources: `REFLEX_AGENT_<KEY>` process variables and `--env-file` files.

use super::{ConfigLayer, LAYER_ENVIRONMENT, LAYER_ENV_FILE};
use crate::config::schema;
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "REFLEX_AGENT_";

/// Variables that share the prefix but configure something other than settings.
const RESERVED: &[&str] = &["LOG", "PAIR_TOKEN", "PAIR_MODE"];

/// Build a layer from `(name, value)` pairs. Unrecognized keys are skipped;
/// values that fail coercion are skipped with a warning.
pub fn from_vars<I>(layer_name: &str, vars: I) -> ConfigLayer
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut values = BTreeMap::new();
    for (name, raw) in vars {
        let Some(suffix) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if RESERVED
            .iter()
            .any(|r| suffix == *r || suffix.starts_with(&format!("{}_", r)))
        {
            continue;
        }
        let key = schema::normalize_key(suffix);
        let spec = match schema::lookup(&key) {
            Ok(spec) => spec,
            Err(_) => {
                debug!(variable = %name, layer = layer_name, "Ignoring unrecognized setting variable");
                continue;
            }
        };
        match spec.coerce(&raw) {
            Ok(value) => {
                values.insert(spec.key.to_string(), value);
            }
            Err(e) => {
                warn!(variable = %name, layer = layer_name, error = %e, "Ignoring invalid setting variable");
            }
        }
    }
    ConfigLayer::new(layer_name, values)
}

/// Layer built from the current process environment.
pub fn process_environment() -> ConfigLayer {
    from_vars(LAYER_ENVIRONMENT, std::env::vars())
}

/// Parsed `.env` style file. The process environment is left untouched.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let to_error = |reason: String| ConfigError::EnvFile {
            path: path.to_path_buf(),
            reason,
        };
        let iter = dotenvy::from_path_iter(path).map_err(|e| to_error(e.to_string()))?;
        let mut vars = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| to_error(e.to_string()))?;
            vars.insert(key, value);
        }
        debug!(path = %path.display(), count = vars.len(), "Loaded env file");
        Ok(Self {
            path: path.to_path_buf(),
            vars,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn layer(&self) -> ConfigLayer {
        from_vars(LAYER_ENV_FILE, self.vars.clone())
    }
}

/// Look up a variable in the process environment, then in the env file.
pub fn resolve_var(name: &str, env_file: Option<&EnvFile>) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env_file.and_then(|f| f.get(name)).map(str::to_string))
}
