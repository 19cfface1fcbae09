//! Replay unit: the single consumer of the durable queue.

use super::{RuntimeShared, RuntimeState};
use crate::error::{AgentError, ConsoleError, QueueError};
use crate::queue::FailOutcome;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub dead_lettered: usize,
    /// Actions still queued after the pass
    pub remaining: usize,
    /// The head action is waiting out a retry delay
    pub deferred: bool,
}

/// Deliver from the head until the queue is empty or the head cannot be
/// delivered. The head blocks everything behind it.
pub(crate) async fn drain(shared: &RuntimeShared) -> Result<DrainReport, AgentError> {
    let _consumer = shared.consumer.lock().await;
    let mut report = DrainReport::default();
    if !shared.options.contact_console {
        report.remaining = shared.queue.len();
        return Ok(report);
    }
    let identity = shared.paired_identity()?;
    let policy = shared.store.settings().retry_policy();

    while shared.state() != RuntimeState::ShuttingDown {
        let Some(action) = shared.queue.peek()? else {
            break;
        };
        let gated = *shared.retry_gate.lock();
        if let Some((id, not_before)) = gated {
            if id == action.id && Instant::now() < not_before {
                report.deferred = true;
                break;
            }
        }

        match shared
            .client
            .deliver(&identity, action.kind, &action.payload)
            .await
        {
            Ok(()) => {
                shared.record_contact(Ok(()));
                match shared.queue.ack(action.id) {
                    Ok(()) | Err(QueueError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                *shared.retry_gate.lock() = None;
                report.delivered += 1;
                debug!(action_id = %action.id, kind = action.kind.as_str(), "Replayed action");
            }
            Err(e) => {
                shared.record_contact(Err(&e));
                match shared.queue.fail(action.id, &e.to_string())? {
                    FailOutcome::DeadLettered { .. } => {
                        *shared.retry_gate.lock() = None;
                        report.dead_lettered += 1;
                        if is_action_specific(&e) {
                            continue;
                        }
                        break;
                    }
                    FailOutcome::Retrying { attempts } => {
                        let delay = policy.backoff(attempts);
                        *shared.retry_gate.lock() = Some((action.id, Instant::now() + delay));
                        debug!(
                            action_id = %action.id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Delivery failed, retrying later"
                        );
                        report.deferred = true;
                        break;
                    }
                }
            }
        }
    }

    report.remaining = shared.queue.len();
    Ok(report)
}

/// Failures tied to the action itself rather than the link or credentials.
fn is_action_specific(error: &ConsoleError) -> bool {
    matches!(error, ConsoleError::Status { .. } | ConsoleError::Malformed(_))
}

pub(crate) async fn replay_loop(shared: Arc<RuntimeShared>, mut stop: watch::Receiver<bool>) {
    debug!("Replay unit started");
    loop {
        let interval = shared.store.settings().replay_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.drain_now.notified() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }
        if shared.state() != RuntimeState::Connected || shared.queue.is_empty() {
            continue;
        }

        match drain(&shared).await {
            Ok(report) if report.delivered > 0 || report.dead_lettered > 0 => info!(
                delivered = report.delivered,
                dead_lettered = report.dead_lettered,
                remaining = report.remaining,
                "Replayed queued actions"
            ),
            Ok(_) => {}
            Err(e @ (AgentError::NotPaired | AgentError::Revoked)) => {
                debug!(reason = %e, "Replay skipped")
            }
            Err(AgentError::Queue(e)) => error!(error = %e, "Queue failure during replay"),
            Err(e) => warn!(error = %e, "Replay pass failed"),
        }
    }
    debug!("Replay unit stopped");
}
