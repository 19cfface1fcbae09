//! Outbound action routing: direct send or durable queue.

use super::{RuntimeShared, RuntimeState};
use crate::error::{AgentError, QueueError};
use crate::queue::{ActionKind, DurableQueue};
use crate::role::{ActionSink, Submission};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Dispatcher {
    shared: Arc<RuntimeShared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<RuntimeShared>) -> Self {
        Self { shared }
    }

    /// Direct sends would overtake queued actions unless the queue is empty.
    fn can_send_directly(&self) -> bool {
        self.shared.options.contact_console
            && self.shared.state() == RuntimeState::Connected
            && self.shared.queue.is_empty()
    }
}

/// Persist an action. A heartbeat is dropped when one is already pending.
pub(crate) fn enqueue_action(
    queue: &DurableQueue,
    kind: ActionKind,
    payload: Vec<u8>,
) -> Result<Submission, QueueError> {
    if kind == ActionKind::Heartbeat && queue.has_pending(ActionKind::Heartbeat)? {
        debug!("Heartbeat already queued, coalescing");
        return Ok(Submission::Coalesced);
    }
    let id = queue.enqueue(kind, payload)?;
    Ok(Submission::Queued(id))
}

#[async_trait]
impl ActionSink for Dispatcher {
    async fn submit(&self, kind: ActionKind, payload: Value) -> Result<Submission, AgentError> {
        let bytes = serde_json::to_vec(&payload).map_err(|e| QueueError::Codec(e.to_string()))?;

        if self.can_send_directly() {
            if let Ok(identity) = self.shared.paired_identity() {
                match self.shared.client.deliver(&identity, kind, &bytes).await {
                    Ok(()) => {
                        self.shared.record_contact(Ok(()));
                        debug!(kind = kind.as_str(), "Delivered action directly");
                        return Ok(Submission::Delivered);
                    }
                    Err(e) => {
                        self.shared.record_contact(Err(&e));
                        warn!(kind = kind.as_str(), error = %e, "Direct delivery failed, queueing action");
                    }
                }
            }
        }

        let submission = enqueue_action(&self.shared.queue, kind, bytes)?;
        if let Submission::Queued(id) = submission {
            debug!(
                action_id = %id,
                kind = kind.as_str(),
                depth = self.shared.queue.len(),
                "Queued action"
            );
            if self.shared.state() == RuntimeState::Connected {
                self.shared.drain_now.notify_one();
            }
        }
        Ok(submission)
    }
}
