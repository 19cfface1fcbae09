//! Poller role: one result per configured input per invocation.

use crate::error::RoleError;
use crate::role::{Role, RoleContext, RoleResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

pub const NAME: &str = "poller";

#[derive(Debug, Clone, Default, Deserialize)]
struct PollerConfig {
    #[serde(default)]
    inputs: Vec<String>,
}

#[derive(Debug)]
pub struct Poller {
    inputs: Vec<String>,
}

impl Poller {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        let parsed: PollerConfig = if config.is_null() {
            PollerConfig::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| e.to_string())?
        };
        Ok(Self {
            inputs: parsed.inputs,
        })
    }
}

#[async_trait]
impl Role for Poller {
    async fn run(&self, ctx: RoleContext) -> Result<RoleResult, RoleError> {
        let agent_id = ctx
            .identity
            .as_ref()
            .map(|i| i.agent_id.clone())
            .ok_or_else(|| RoleError::Failed("agent is not paired".to_string()))?;
        let polled_at = Utc::now().to_rfc3339();

        let mut outputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if ctx.is_cancelled() {
                return Err(RoleError::Cancelled);
            }
            outputs.push(json!({
                "role": NAME,
                "agent_id": agent_id,
                "input": input,
                "polled_at": polled_at,
            }));
        }

        Ok(RoleResult {
            outputs,
            status: Some(json!({
                "role": NAME,
                "inputs": self.inputs.len(),
                "polled_at": polled_at,
            })),
        })
    }
}
