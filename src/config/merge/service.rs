//! MergeService: feeds ordered layers through `config::ConfigBuilder` and
//! deserializes the result to `AgentSettings`.
//!
//! Document-valued keys never enter the builder: `config` folds table keys to
//! lower case, which would rename roles and their options. They are deep-merged
//! over `serde_json::Value` instead.

use crate::config::sources::ConfigLayer;
use crate::config::AgentSettings;
use crate::error::ConfigError;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys whose values are JSON documents merged outside the builder.
const DOCUMENT_KEYS: &[&str] = &["role_configs"];

/// Merge result with the winning layer per top-level key.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSettings {
    pub settings: AgentSettings,
    pub origins: BTreeMap<String, String>,
}

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Merge layers in slice order; later layers win. Scalars and lists are
    /// replaced, tables merge key by key. Touches no filesystem.
    pub fn merge(layers: &[ConfigLayer]) -> Result<MergedSettings, ConfigError> {
        let mut builder: ConfigBuilder<DefaultState> = config::Config::builder();
        let mut origins = BTreeMap::new();
        let mut role_configs = Value::Object(Default::default());
        for layer in layers {
            if layer.is_empty() {
                continue;
            }
            for key in layer.values.keys() {
                origins.insert(key.clone(), layer.name.clone());
            }

            let mut scalars = layer.clone();
            for key in DOCUMENT_KEYS {
                if let Some(document) = scalars.values.remove(*key) {
                    deep_merge(&mut role_configs, document);
                }
            }
            if !scalars.is_empty() {
                builder = builder.add_source(scalars);
            }
        }

        let merged = builder.build()?;
        let mut settings: AgentSettings = merged.try_deserialize()?;
        if let Value::Object(tables) = role_configs {
            settings.role_configs = tables.into_iter().collect();
        }
        Ok(MergedSettings { settings, origins })
    }
}

/// Overlay `next` onto `base`. Objects merge key by key; anything else,
/// lists included, replaces the lower value.
pub fn deep_merge(base: &mut Value, next: Value) {
    match (base, next) {
        (Value::Object(lower), Value::Object(upper)) => {
            for (key, value) in upper {
                match lower.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        lower.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Merge layers and keep only the settings.
pub fn merge_layers(layers: &[ConfigLayer]) -> Result<AgentSettings, ConfigError> {
    MergeService::merge(layers).map(|merged| merged.settings)
}
