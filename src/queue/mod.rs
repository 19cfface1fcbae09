//! Durable task queue for outbound console actions.
//!
//! Multi-producer, single-consumer. Delivery order is strict FIFO by id: a
//! failing head blocks everything behind it.

pub mod action;
pub mod store;

pub use action::{ActionKind, DeadLetter, FailOutcome, QueuedAction};
pub use store::DurableQueue;
