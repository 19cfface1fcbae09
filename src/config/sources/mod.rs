//! Configuration layers fed to the merge service.
//!
//! Each layer is a sparse map of already-coerced values tagged with the name
//! of the place it came from.

pub mod environment;

use crate::config::AgentSettings;
use crate::error::ConfigError;
use serde_json::Value;
use std::collections::BTreeMap;

pub const LAYER_DEFAULTS: &str = "default";
pub const LAYER_PERSISTED: &str = "persisted";
pub const LAYER_ENV_FILE: &str = "env-file";
pub const LAYER_ENVIRONMENT: &str = "environment";
pub const LAYER_OVERRIDES: &str = "override";

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    pub name: String,
    pub values: BTreeMap<String, Value>,
}

impl ConfigLayer {
    pub fn new(name: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, BTreeMap::new())
    }

    /// Built-in defaults as a full layer.
    pub fn defaults() -> Result<Self, ConfigError> {
        let value = serde_json::to_value(AgentSettings::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let values = match value {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(ConfigError::Serialize(format!(
                    "defaults serialized to {}",
                    other
                )))
            }
        };
        Ok(Self::new(LAYER_DEFAULTS, values))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl config::Source for ConfigLayer {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        let origin = self.name.clone();
        Ok(self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), to_config_value(&origin, value)))
            .collect())
    }
}

fn to_config_value(origin: &String, value: &Value) -> config::Value {
    let kind = match value {
        Value::Null => config::ValueKind::Nil,
        Value::Bool(b) => config::ValueKind::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => config::ValueKind::I64(i),
            (None, Some(u)) => config::ValueKind::U64(u),
            _ => config::ValueKind::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => config::ValueKind::String(s.clone()),
        Value::Array(items) => config::ValueKind::Array(
            items.iter().map(|i| to_config_value(origin, i)).collect(),
        ),
        Value::Object(map) => config::ValueKind::Table(
            map.iter()
                .map(|(k, v)| (k.clone(), to_config_value(origin, v)))
                .collect(),
        ),
    };
    config::Value::new(Some(origin), kind)
}
