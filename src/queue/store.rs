//! sled-backed durable queue.
//!
//! Pending actions live in the `pending` tree keyed by big-endian id, so
//! `first()` is always the oldest. Dead letters move to `dead_letter` in the
//! same transaction that removes them from `pending`. Every mutation is flushed
//! before the call returns.

use super::action::{ActionKind, DeadLetter, FailOutcome, QueuedAction};
use crate::error::QueueError;
use crate::types::ActionId;
use chrono::Utc;
use parking_lot::Mutex;
use sled::transaction::TransactionError;
use sled::Transactional;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

const PENDING_TREE: &str = "pending";
const DEAD_LETTER_TREE: &str = "dead_letter";

/// Log target for dead-letter events.
pub const DEAD_LETTER_TARGET: &str = "reflex_agent::queue::dead_letter";

pub struct DurableQueue {
    db: sled::Db,
    pending: sled::Tree,
    dead: sled::Tree,
    max_attempts: AtomicU32,
    /// Id allocation and insert happen together so ids land in order
    append: Mutex<()>,
}

impl DurableQueue {
    pub fn open(path: &Path, max_attempts: u32) -> Result<Self, QueueError> {
        let db = sled::open(path)?;
        Self::from_db(db, max_attempts)
    }

    /// In-memory queue for one-shot runs and tests.
    pub fn temporary(max_attempts: u32) -> Result<Self, QueueError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, max_attempts)
    }

    fn from_db(db: sled::Db, max_attempts: u32) -> Result<Self, QueueError> {
        let pending = db.open_tree(PENDING_TREE)?;
        let dead = db.open_tree(DEAD_LETTER_TREE)?;
        Ok(Self {
            db,
            pending,
            dead,
            max_attempts: AtomicU32::new(max_attempts.max(1)),
            append: Mutex::new(()),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::Relaxed)
    }

    pub fn set_max_attempts(&self, max_attempts: u32) {
        self.max_attempts.store(max_attempts.max(1), Ordering::Relaxed);
    }

    /// Append and flush. Safe for concurrent producers.
    pub fn enqueue(&self, kind: ActionKind, payload: Vec<u8>) -> Result<ActionId, QueueError> {
        let _guard = self.append.lock();
        let id = ActionId(self.db.generate_id()?);
        let action = QueuedAction {
            id,
            kind,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        self.pending
            .insert(id.to_key(), bincode::serialize(&action)?)?;
        self.pending.flush()?;
        debug!(action_id = %id, kind = %kind, "Enqueued action");
        Ok(id)
    }

    /// Oldest pending action, if any.
    pub fn peek(&self) -> Result<Option<QueuedAction>, QueueError> {
        match self.pending.first()? {
            Some((_, bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove an acknowledged action.
    pub fn ack(&self, id: ActionId) -> Result<(), QueueError> {
        if self.pending.remove(id.to_key())?.is_none() {
            return Err(QueueError::NotFound(id));
        }
        self.pending.flush()?;
        debug!(action_id = %id, "Acknowledged action");
        Ok(())
    }

    /// Record a failed delivery. Once attempts reach the maximum the action
    /// moves to the dead-letter record and is never returned by `peek` again.
    pub fn fail(&self, id: ActionId, error: &str) -> Result<FailOutcome, QueueError> {
        let key = id.to_key();
        let Some(bytes) = self.pending.get(key)? else {
            return Err(QueueError::NotFound(id));
        };
        let mut action: QueuedAction = bincode::deserialize(&bytes)?;
        action.attempts = action.attempts.saturating_add(1);
        action.last_error = Some(error.to_string());
        let attempts = action.attempts;

        if attempts < self.max_attempts() {
            self.pending.insert(key, bincode::serialize(&action)?)?;
            self.pending.flush()?;
            debug!(action_id = %id, attempts, error, "Delivery failed, will retry");
            return Ok(FailOutcome::Retrying { attempts });
        }

        let kind = action.kind;
        let letter = DeadLetter {
            action,
            dead_lettered_at: Utc::now(),
        };
        let encoded = bincode::serialize(&letter)?;
        (&self.pending, &self.dead)
            .transaction(|(pending, dead)| {
                pending.remove(&key[..])?;
                dead.insert(&key[..], encoded.clone())?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Storage(e) => QueueError::from(e),
                TransactionError::Abort(()) => {
                    QueueError::Storage("dead-letter transaction aborted".to_string())
                }
            })?;
        self.db.flush()?;

        warn!(
            target: DEAD_LETTER_TARGET,
            action_id = %id,
            kind = %kind,
            attempts,
            last_error = error,
            "Action moved to dead-letter after exhausting delivery attempts"
        );
        Ok(FailOutcome::DeadLettered { attempts })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending actions in delivery order.
    pub fn pending(&self) -> Result<Vec<QueuedAction>, QueueError> {
        self.pending
            .iter()
            .values()
            .map(|bytes| -> Result<QueuedAction, QueueError> {
                Ok(bincode::deserialize(&bytes?)?)
            })
            .collect()
    }

    pub fn has_pending(&self, kind: ActionKind) -> Result<bool, QueueError> {
        for bytes in self.pending.iter().values() {
            let action: QueuedAction = bincode::deserialize(&bytes?)?;
            if action.kind == kind {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.dead
            .iter()
            .values()
            .map(|bytes| -> Result<DeadLetter, QueueError> {
                Ok(bincode::deserialize(&bytes?)?)
            })
            .collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead.len()
    }

    /// Drop pending and dead-letter records.
    pub fn clear(&self) -> Result<(), QueueError> {
        self.pending.clear()?;
        self.dead.clear()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), QueueError> {
        self.db.flush()?;
        Ok(())
    }
}
