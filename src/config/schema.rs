//! Recognized configuration keys, their declared types and value coercion.

use crate::error::ConfigError;
use serde_json::Value;

/// Declared type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text,
    Integer { min: i64 },
    Boolean,
    /// Ordered list of strings with set semantics
    List,
    /// JSON object
    Document,
}

impl ValueType {
    fn expected(&self) -> String {
        match self {
            ValueType::Text => "expected text".to_string(),
            ValueType::Integer { min } => format!("expected an integer >= {}", min),
            ValueType::Boolean => "expected true/false, yes/no, on/off or 1/0".to_string(),
            ValueType::List => "expected a comma separated list".to_string(),
            ValueType::Document => "expected a JSON object".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub key: &'static str,
    pub value_type: ValueType,
    pub description: &'static str,
}

pub const SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        key: "name",
        value_type: ValueType::Text,
        description: "Agent display name sent on pairing",
    },
    SettingSpec {
        key: "roles",
        value_type: ValueType::List,
        description: "Roles to activate",
    },
    SettingSpec {
        key: "role_configs",
        value_type: ValueType::Document,
        description: "Per-role settings tables",
    },
    SettingSpec {
        key: "health_check_interval",
        value_type: ValueType::Integer { min: 1 },
        description: "Seconds between heartbeats",
    },
    SettingSpec {
        key: "replay_interval",
        value_type: ValueType::Integer { min: 1 },
        description: "Seconds between queue drain passes",
    },
    SettingSpec {
        key: "console_timeout",
        value_type: ValueType::Integer { min: 1 },
        description: "Seconds allowed per console request",
    },
    SettingSpec {
        key: "role_timeout",
        value_type: ValueType::Integer { min: 1 },
        description: "Seconds allowed per role invocation",
    },
    SettingSpec {
        key: "shutdown_grace_period",
        value_type: ValueType::Integer { min: 0 },
        description: "Seconds in-flight roles may run after shutdown",
    },
    SettingSpec {
        key: "max_delivery_attempts",
        value_type: ValueType::Integer { min: 1 },
        description: "Failed deliveries before an action is dead-lettered",
    },
    SettingSpec {
        key: "retry_base_delay_ms",
        value_type: ValueType::Integer { min: 0 },
        description: "Backoff base delay",
    },
    SettingSpec {
        key: "retry_max_delay_ms",
        value_type: ValueType::Integer { min: 0 },
        description: "Backoff cap",
    },
    SettingSpec {
        key: "ignore_tls",
        value_type: ValueType::Boolean,
        description: "Accept invalid console certificates",
    },
    SettingSpec {
        key: "policy_sync",
        value_type: ValueType::Boolean,
        description: "Pull console policy after heartbeats",
    },
];

/// Document sections owned by pairing and policy sync, not settable by key.
const MANAGED_KEYS: &[&str] = &["identity", "policy"];

/// Canonical key form: trimmed, lower case.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Look up a recognized key.
pub fn lookup(key: &str) -> Result<&'static SettingSpec, ConfigError> {
    let normalized = normalize_key(key);
    if let Some(spec) = SETTINGS.iter().find(|s| s.key == normalized) {
        return Ok(spec);
    }
    let reason = if MANAGED_KEYS.contains(&normalized.as_str()) {
        "managed by pairing; use --pair or --reset-console-pairing".to_string()
    } else {
        format!("valid keys are {}", valid_keys().join(", "))
    };
    Err(ConfigError::InvalidKey {
        key: key.trim().to_string(),
        reason,
    })
}

pub fn valid_keys() -> Vec<&'static str> {
    SETTINGS.iter().map(|s| s.key).collect()
}

/// Split `KEY:VALUE` on the first colon; the value may itself contain colons.
pub fn parse_assignment(input: &str) -> Result<(String, String), ConfigError> {
    match input.split_once(':') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((normalize_key(key), value.trim().to_string()))
        }
        _ => Err(ConfigError::Syntax(input.to_string())),
    }
}

/// Comma split with trimming; empty items and repeats are dropped, first occurrence wins.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        if !items.iter().any(|existing| existing == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Coerce a raw string for `key` to its declared type.
pub fn coerce(key: &str, raw: &str) -> Result<Value, ConfigError> {
    lookup(key)?.coerce(raw)
}

impl SettingSpec {
    fn invalid(&self, value: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.key.to_string(),
            value: value.into(),
            expected: self.value_type.expected(),
        }
    }

    /// Parse a raw textual value.
    pub fn coerce(&self, raw: &str) -> Result<Value, ConfigError> {
        let trimmed = raw.trim();
        match self.value_type {
            ValueType::Text => Ok(Value::String(trimmed.to_string())),
            ValueType::Integer { min } => match trimmed.parse::<i64>() {
                Ok(n) if n >= min => Ok(Value::from(n)),
                _ => Err(self.invalid(raw)),
            },
            ValueType::Boolean => parse_bool(trimmed)
                .map(Value::Bool)
                .ok_or_else(|| self.invalid(raw)),
            ValueType::List => Ok(Value::Array(
                split_list(trimmed).into_iter().map(Value::String).collect(),
            )),
            ValueType::Document => match serde_json::from_str::<Value>(trimmed) {
                Ok(doc @ Value::Object(_)) => Ok(doc),
                _ => Err(self.invalid(raw)),
            },
        }
    }

    /// Check an already structured value (console policy, persisted document).
    /// Strings go through [`SettingSpec::coerce`].
    pub fn validate(&self, value: &Value) -> Result<Value, ConfigError> {
        if let Value::String(raw) = value {
            if self.value_type != ValueType::Text {
                return self.coerce(raw);
            }
        }
        match (self.value_type, value) {
            (ValueType::Text, Value::String(s)) => Ok(Value::String(s.trim().to_string())),
            (ValueType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ValueType::Integer { min }, Value::Number(n)) => match n.as_i64() {
                Some(i) if i >= min => Ok(Value::from(i)),
                _ => Err(self.invalid(value.to_string())),
            },
            (ValueType::Boolean, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (ValueType::List, Value::Array(items)) => {
                let mut joined = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => joined.push(s.clone()),
                        other => return Err(self.invalid(other.to_string())),
                    }
                }
                Ok(Value::Array(
                    split_list(&joined.join(","))
                        .into_iter()
                        .map(Value::String)
                        .collect(),
                ))
            }
            (ValueType::Document, Value::Object(_)) => Ok(value.clone()),
            _ => Err(self.invalid(value.to_string())),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
