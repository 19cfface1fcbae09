//! Heartbeat unit and console policy sync.

use super::dispatch::enqueue_action;
use super::RuntimeShared;
use crate::config::PolicyRecord;
use crate::console::HeartbeatBody;
use crate::error::{AgentError, QueueError};
use crate::pairing::AgentIdentity;
use crate::queue::ActionKind;
use crate::role::Submission;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Console acknowledged; `policy_changed` when a new policy was applied
    Delivered { policy_changed: bool },
    /// Console not contacted or unreachable; kept for replay
    Deferred(Submission),
}

fn build_body(shared: &RuntimeShared) -> HeartbeatBody {
    let settings = shared.store.settings();
    let health_issues = shared.health.issues();
    HeartbeatBody {
        name: settings.name,
        version: crate::VERSION.to_string(),
        state: shared.state().to_string(),
        healthy: health_issues.is_empty(),
        health_issues,
        queue_depth: shared.queue.len(),
        dead_letters: shared.queue.dead_letter_count(),
    }
}

fn defer(shared: &RuntimeShared, body: &HeartbeatBody) -> Result<HeartbeatOutcome, AgentError> {
    let payload = serde_json::to_vec(body).map_err(|e| QueueError::Codec(e.to_string()))?;
    let submission = enqueue_action(&shared.queue, ActionKind::Heartbeat, payload)?;
    Ok(HeartbeatOutcome::Deferred(submission))
}

pub(crate) async fn heartbeat_once(shared: &RuntimeShared) -> Result<HeartbeatOutcome, AgentError> {
    let identity = shared.paired_identity()?;
    let body = build_body(shared);
    if !shared.options.contact_console {
        return defer(shared, &body);
    }

    match shared.client.heartbeat(&identity, &body).await {
        Ok(()) => {
            shared.record_contact(Ok(()));
            debug!(
                agent_id = %identity.agent_id,
                queue_depth = body.queue_depth,
                healthy = body.healthy,
                "Heartbeat delivered"
            );
            let policy_changed = sync_policy(shared, &identity).await;
            Ok(HeartbeatOutcome::Delivered { policy_changed })
        }
        Err(e) => {
            shared.record_contact(Err(&e));
            if e.is_rejection() {
                return Err(AgentError::Revoked);
            }
            if e.is_transport() {
                defer(shared, &body)?;
            }
            Err(e.into())
        }
    }
}

/// Fetch the console policy and apply it when its revision or uuid changed.
async fn sync_policy(shared: &RuntimeShared, identity: &AgentIdentity) -> bool {
    if !shared.store.settings().policy_sync {
        return false;
    }
    let policy = match shared.client.fetch_policy(identity).await {
        Ok(Some(policy)) => policy,
        Ok(None) => return false,
        Err(e) => {
            shared.record_contact(Err(&e));
            warn!(error = %e, "Policy fetch failed");
            return false;
        }
    };

    let current = shared.store.snapshot().policy.clone();
    if current
        .as_ref()
        .is_some_and(|p| p.revision == policy.revision && p.uuid == policy.uuid)
    {
        return false;
    }

    let record = PolicyRecord {
        revision: policy.revision,
        uuid: policy.uuid.clone(),
    };
    match shared.store.apply_policy(record, &policy.settings) {
        Ok(outcome) => {
            shared
                .queue
                .set_max_attempts(shared.store.settings().max_delivery_attempts);
            info!(
                revision = policy.revision,
                uuid = %policy.uuid,
                applied = outcome.applied.len(),
                rejected = outcome.rejected.len(),
                "Applied console policy"
            );
            outcome.changed
        }
        Err(e) => {
            error!(revision = policy.revision, error = %e, "Failed to persist console policy");
            false
        }
    }
}

pub(crate) async fn heartbeat_loop(shared: Arc<RuntimeShared>, mut stop: watch::Receiver<bool>) {
    debug!("Heartbeat unit started");
    loop {
        match heartbeat_once(&shared).await {
            Ok(outcome) => debug!(?outcome, "Heartbeat cycle"),
            Err(e @ (AgentError::NotPaired | AgentError::Revoked)) => {
                debug!(reason = %e, "Heartbeat skipped")
            }
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }

        let interval = shared.store.settings().health_check_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }
    }
    debug!("Heartbeat unit stopped");
}
