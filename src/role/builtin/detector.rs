//! Detector role: reports the detection rules it has loaded.

use crate::error::RoleError;
use crate::role::{Role, RoleContext, RoleResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

pub const NAME: &str = "detector";

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    name: String,
    #[serde(default = "enabled")]
    enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct DetectorConfig {
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug)]
pub struct Detector {
    rules: Vec<Rule>,
}

impl Detector {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        let parsed: DetectorConfig = if config.is_null() {
            DetectorConfig::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| e.to_string())?
        };
        Ok(Self {
            rules: parsed.rules,
        })
    }
}

#[async_trait]
impl Role for Detector {
    async fn run(&self, ctx: RoleContext) -> Result<RoleResult, RoleError> {
        if ctx.is_cancelled() {
            return Err(RoleError::Cancelled);
        }
        let active: Vec<&str> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.name.as_str())
            .collect();
        Ok(RoleResult {
            outputs: Vec::new(),
            status: Some(json!({
                "role": NAME,
                "rules_loaded": self.rules.len(),
                "rules_active": active,
                "checked_at": Utc::now().to_rfc3339(),
            })),
        })
    }
}
