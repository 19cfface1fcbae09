//! Roles bundled with the agent.

pub mod detector;
pub mod poller;

use super::registry::{RoleDescriptor, RoleDiscovery};
use std::sync::Arc;

/// Discovery source for the bundled roles.
pub struct BuiltinRoles;

impl RoleDiscovery for BuiltinRoles {
    fn discover(&self) -> Vec<RoleDescriptor> {
        vec![
            RoleDescriptor::new(
                poller::NAME,
                crate::VERSION,
                "Reports configured inputs to the console",
                |config| Ok(Arc::new(poller::Poller::from_config(config)?)),
            ),
            RoleDescriptor::new(
                detector::NAME,
                crate::VERSION,
                "Reports loaded detection rules to the console",
                |config| Ok(Arc::new(detector::Detector::from_config(config)?)),
            ),
        ]
    }
}
