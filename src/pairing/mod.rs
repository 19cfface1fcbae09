//! Agent identity lifecycle against the console.

pub mod identity;
pub mod machine;

pub use identity::{AgentIdentity, PairingStatus, PairingToken};
pub use machine::{PairingAttempt, PairingMachine};
