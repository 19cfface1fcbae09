//! Role registry: descriptors by name, discovery and activation.

use super::Role;
use crate::config::AgentSettings;
use crate::error::RoleActivationError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name under which role packages register their descriptors.
pub const EXTENSION_POINT: &str = "reflex_agent.roles";

/// Cadence used when a role table has no `wait_interval`.
pub const DEFAULT_ROLE_CADENCE: Duration = Duration::from_secs(10);

pub type RoleFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Role>, String> + Send + Sync>;

/// An installable role: name, version and a constructor.
#[derive(Clone)]
pub struct RoleDescriptor {
    pub name: String,
    pub version: String,
    pub summary: String,
    factory: RoleFactory,
}

impl RoleDescriptor {
    pub fn new<F>(name: &str, version: &str, summary: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Role>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            summary: summary.to_string(),
            factory: Arc::new(factory),
        }
    }

    pub fn instantiate(&self, config: &Value) -> Result<Arc<dyn Role>, String> {
        (self.factory)(config)
    }
}

impl fmt::Debug for RoleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// Source of descriptors registered under [`EXTENSION_POINT`].
pub trait RoleDiscovery: Send + Sync {
    fn extension_point(&self) -> &str {
        EXTENSION_POINT
    }

    fn discover(&self) -> Vec<RoleDescriptor>;
}

/// Fixed descriptor set, for tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery(pub Vec<RoleDescriptor>);

impl RoleDiscovery for StaticDiscovery {
    fn discover(&self) -> Vec<RoleDescriptor> {
        self.0.clone()
    }
}

/// A constructed role ready to schedule.
#[derive(Clone)]
pub struct RoleInstance {
    pub name: String,
    pub version: String,
    pub role: Arc<dyn Role>,
    pub config: Value,
    pub cadence: Duration,
    pub timeout: Duration,
}

impl fmt::Debug for RoleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleInstance")
            .field("name", &self.name)
            .field("cadence", &self.cadence)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of `activate`: instances in request order plus diagnostics for
/// names that could not be activated.
#[derive(Debug, Default)]
pub struct Activation {
    pub instances: Vec<RoleInstance>,
    pub diagnostics: Vec<RoleActivationError>,
}

impl Activation {
    pub fn get(&self, name: &str) -> Option<&RoleInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }
}

/// Role registry for managing installed descriptors.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    descriptors: BTreeMap<String, RoleDescriptor>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from every discovery source, without activating anything.
    pub fn discover(sources: &[&dyn RoleDiscovery]) -> Self {
        let mut registry = Self::new();
        for source in sources {
            for descriptor in source.discover() {
                debug!(
                    extension_point = source.extension_point(),
                    role = %descriptor.name,
                    version = %descriptor.version,
                    "Discovered role"
                );
                registry.register(descriptor);
            }
        }
        registry
    }

    /// Registry with the roles bundled in this crate.
    pub fn builtin() -> Self {
        Self::discover(&[&super::builtin::BuiltinRoles])
    }

    /// Register a descriptor. Names are unique; the first registration wins.
    pub fn register(&mut self, descriptor: RoleDescriptor) -> bool {
        if self.descriptors.contains_key(&descriptor.name) {
            warn!(role = %descriptor.name, "Duplicate role descriptor ignored");
            return false;
        }
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        true
    }

    pub fn get(&self, name: &str) -> Option<&RoleDescriptor> {
        self.descriptors.get(name)
    }

    pub fn get_or_error(&self, name: &str) -> Result<&RoleDescriptor, RoleActivationError> {
        self.get(name)
            .ok_or_else(|| RoleActivationError::MissingDescriptor {
                name: name.to_string(),
            })
    }

    pub fn list_all(&self) -> Vec<&RoleDescriptor> {
        self.descriptors.values().collect()
    }

    /// Construct instances for `names`. Missing or failing roles are recorded
    /// as diagnostics and skipped; the rest still activate.
    pub fn activate(&self, names: &[String], settings: &AgentSettings) -> Activation {
        let mut activation = Activation::default();
        for name in names {
            if activation.get(name).is_some() {
                continue;
            }
            let descriptor = match self.get_or_error(name) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(role = %name, "{}", e);
                    activation.diagnostics.push(e);
                    continue;
                }
            };

            let config = settings.role_config(name);
            match descriptor.instantiate(&config) {
                Ok(role) => {
                    let cadence = cadence_from(&config);
                    debug!(role = %name, cadence_secs = cadence.as_secs(), "Activated role");
                    activation.instances.push(RoleInstance {
                        name: name.clone(),
                        version: descriptor.version.clone(),
                        role,
                        config,
                        cadence,
                        timeout: settings.role_timeout(),
                    });
                }
                Err(reason) => {
                    let e = RoleActivationError::Construction {
                        name: name.clone(),
                        reason,
                    };
                    warn!(role = %name, "{}", e);
                    activation.diagnostics.push(e);
                }
            }
        }
        activation
    }
}

/// `wait_interval` seconds from a role table.
fn cadence_from(config: &Value) -> Duration {
    config
        .get("wait_interval")
        .and_then(Value::as_u64)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_ROLE_CADENCE)
}
