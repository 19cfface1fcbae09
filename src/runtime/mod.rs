//! Agent runtime.
//!
//! One tokio runtime hosts three kinds of unit: the heartbeat loop, the
//! replay consumer draining the durable queue, and one unit per active role.
//! A supervisor restarts role units when the effective configuration changes.
//!
//! Connectivity is tracked in [`RuntimeState`]. Actions are sent directly
//! only while `Connected` with an empty queue; everything else goes through
//! the queue so delivery stays ordered.

mod dispatch;
mod heartbeat;
mod replay;
mod units;

pub use dispatch::Dispatcher;
pub use heartbeat::HeartbeatOutcome;
pub use replay::DrainReport;

use crate::config::ConfigStore;
use crate::console::ConsoleClient;
use crate::error::{AgentError, ConsoleError, RoleActivationError};
use crate::pairing::{AgentIdentity, PairingMachine, PairingStatus};
use crate::queue::DurableQueue;
use crate::role::RoleRegistry;
use crate::types::ActionId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use units::RoleUnit;

/// Connectivity and lifecycle state of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    Initializing,
    /// Identity resolved, console not contacted yet
    Idle,
    Connected,
    Offline,
    ShuttingDown,
}

impl RuntimeState {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Initializing => "initializing",
            RuntimeState::Idle => "idle",
            RuntimeState::Connected => "connected",
            RuntimeState::Offline => "offline",
            RuntimeState::ShuttingDown => "shutting-down",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// When false every action is queued and the console is never contacted.
    pub contact_console: bool,
}

impl RuntimeOptions {
    pub fn offline() -> Self {
        Self {
            contact_console: false,
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            contact_console: true,
        }
    }
}

/// Health issues keyed by source, reported with every heartbeat.
#[derive(Debug, Default)]
pub(crate) struct Health {
    issues: Mutex<BTreeMap<String, String>>,
}

const ACTIVATION_SOURCE: &str = "activation:";
const ROLE_SOURCE: &str = "role:";
const CONTACT_SOURCE: &str = "contact";

impl Health {
    pub(crate) fn record(&self, source: String, issue: String) {
        self.issues.lock().insert(source, issue);
    }

    pub(crate) fn clear(&self, source: &str) {
        self.issues.lock().remove(source);
    }

    /// Replace all activation diagnostics with the latest set.
    pub(crate) fn replace_activation(&self, diagnostics: &[RoleActivationError]) {
        let mut issues = self.issues.lock();
        issues.retain(|source, _| !source.starts_with(ACTIVATION_SOURCE));
        for diagnostic in diagnostics {
            issues.insert(
                format!("{}{}", ACTIVATION_SOURCE, diagnostic.role_name()),
                diagnostic.to_string(),
            );
        }
    }

    pub(crate) fn issues(&self) -> Vec<String> {
        self.issues.lock().values().cloned().collect()
    }
}

/// State shared by every unit.
pub(crate) struct RuntimeShared {
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) pairing: Arc<PairingMachine>,
    pub(crate) client: Arc<dyn ConsoleClient>,
    pub(crate) queue: Arc<DurableQueue>,
    pub(crate) options: RuntimeOptions,
    pub(crate) health: Health,
    state: watch::Sender<RuntimeState>,
    /// Wakes the replay unit for an immediate drain pass
    pub(crate) drain_now: Notify,
    /// Held by whoever is draining the queue; there is one consumer at a time
    pub(crate) consumer: tokio::sync::Mutex<()>,
    /// Head action waiting out its backoff
    pub(crate) retry_gate: Mutex<Option<(ActionId, Instant)>>,
}

impl RuntimeShared {
    pub(crate) fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Move to `next`. `ShuttingDown` is terminal. Returns whether the state changed.
    pub(crate) fn set_state(&self, next: RuntimeState) -> bool {
        let mut from = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == RuntimeState::ShuttingDown {
                return false;
            }
            from = *current;
            *current = next;
            true
        });
        if changed {
            info!(from = %from, to = %next, "Runtime state changed");
        }
        changed
    }

    /// Fold the outcome of a console call into the runtime state.
    ///
    /// Success moves to `Connected` and triggers a drain. Transport failures
    /// move to `Offline` and credential rejections revoke the pairing. Any
    /// other refusal keeps the state and is reported as a health issue until
    /// the next successful call.
    pub(crate) fn record_contact(&self, outcome: Result<(), &ConsoleError>) {
        match outcome {
            Ok(()) => {
                self.health.clear(CONTACT_SOURCE);
                if self.set_state(RuntimeState::Connected) {
                    *self.retry_gate.lock() = None;
                    self.drain_now.notify_one();
                }
            }
            Err(e) if e.is_transport() => {
                if self.set_state(RuntimeState::Offline) {
                    warn!(error = %e, "Console unreachable, queueing outbound actions");
                }
            }
            Err(e) if e.is_rejection() => {
                if let Err(err) = self.pairing.mark_revoked() {
                    error!(error = %err, "Failed to record revoked pairing");
                }
            }
            Err(e) => {
                error!(error = %e, state = %self.state(), "Console refused request");
                self.health
                    .record(CONTACT_SOURCE.to_string(), format!("Console refused request: {}", e));
            }
        }
    }

    /// The stored identity, if it may be used to contact the console.
    pub(crate) fn paired_identity(&self) -> Result<AgentIdentity, AgentError> {
        match self.store.identity() {
            Some(identity) if identity.status == PairingStatus::Paired => Ok(identity),
            Some(identity) if identity.status == PairingStatus::Revoked => Err(AgentError::Revoked),
            _ => Err(AgentError::NotPaired),
        }
    }
}

/// Summary of one `run_cycle` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub heartbeat: Option<HeartbeatOutcome>,
    pub heartbeat_error: Option<String>,
    pub roles_run: Vec<String>,
    pub role_failures: Vec<(String, String)>,
    pub drained: DrainReport,
    pub queue_depth: usize,
}

pub struct AgentRuntime {
    shared: Arc<RuntimeShared>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RoleRegistry>,
    units: Arc<Mutex<BTreeMap<String, RoleUnit>>>,
    workers: RwLock<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    running: RwLock<bool>,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<ConfigStore>,
        pairing: Arc<PairingMachine>,
        client: Arc<dyn ConsoleClient>,
        queue: Arc<DurableQueue>,
        registry: RoleRegistry,
        options: RuntimeOptions,
    ) -> Self {
        queue.set_max_attempts(store.settings().max_delivery_attempts);
        let (state, _) = watch::channel(RuntimeState::Initializing);
        let shared = Arc::new(RuntimeShared {
            store,
            pairing,
            client,
            queue,
            options,
            health: Health::default(),
            state,
            drain_now: Notify::new(),
            consumer: tokio::sync::Mutex::new(()),
            retry_gate: Mutex::new(None),
        });
        shared.set_state(RuntimeState::Idle);
        let (stop, _) = watch::channel(false);

        Self {
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&shared))),
            shared,
            registry: Arc::new(registry),
            units: Arc::new(Mutex::new(BTreeMap::new())),
            workers: RwLock::new(Vec::new()),
            stop,
            running: RwLock::new(false),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.shared.state.subscribe()
    }

    /// Action sink used by role units; usable directly by embedders.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.shared.queue
    }

    pub fn health_issues(&self) -> Vec<String> {
        self.shared.health.issues()
    }

    /// Names of roles with a running unit.
    pub fn active_roles(&self) -> Vec<String> {
        self.units.lock().keys().cloned().collect()
    }

    /// Send one heartbeat now.
    pub async fn heartbeat_once(&self) -> Result<HeartbeatOutcome, AgentError> {
        heartbeat::heartbeat_once(&self.shared).await
    }

    /// Deliver queued actions in order until the queue is empty or delivery stalls.
    pub async fn drain_queue(&self) -> Result<DrainReport, AgentError> {
        replay::drain(&self.shared).await
    }

    /// One pass of every unit: heartbeat, each active role once, then a drain.
    pub async fn run_cycle(&self) -> Result<CycleReport, AgentError> {
        let mut report = CycleReport::default();
        if self.shared.options.contact_console {
            match self.heartbeat_once().await {
                Ok(outcome) => report.heartbeat = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Heartbeat failed");
                    report.heartbeat_error = Some(e.to_string());
                }
            }
        }

        let settings = self.shared.store.settings();
        let activation = self.registry.activate(&settings.roles, &settings);
        self.shared.health.replace_activation(&activation.diagnostics);
        let (_cancel, cancelled) = watch::channel(false);
        for instance in &activation.instances {
            match units::invoke(&self.shared, &self.dispatcher, instance, cancelled.clone()).await {
                Ok(_) => report.roles_run.push(instance.name.clone()),
                Err(e) => report
                    .role_failures
                    .push((instance.name.clone(), e.to_string())),
            }
        }

        if self.shared.state() == RuntimeState::Connected {
            report.drained = self.drain_queue().await?;
        }
        report.queue_depth = self.shared.queue.len();
        Ok(report)
    }

    /// Spawn the heartbeat, replay and supervisor units. A runtime that has
    /// been shut down cannot be started again.
    pub fn start(&self) -> Result<(), AgentError> {
        let mut running = self.running.write();
        if *running {
            return Ok(());
        }
        if self.shared.state() == RuntimeState::ShuttingDown {
            return Err(AgentError::ShutDown);
        }
        if self.shared.options.contact_console {
            self.shared.paired_identity()?;
        }
        *running = true;
        drop(running);

        self.stop.send_replace(false);
        let mut workers = self.workers.write();
        workers.push(tokio::spawn(heartbeat::heartbeat_loop(
            Arc::clone(&self.shared),
            self.stop.subscribe(),
        )));
        workers.push(tokio::spawn(replay::replay_loop(
            Arc::clone(&self.shared),
            self.stop.subscribe(),
        )));
        workers.push(tokio::spawn(units::supervise(
            Arc::clone(&self.shared),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            Arc::clone(&self.units),
            self.stop.subscribe(),
        )));

        info!(
            worker_count = workers.len(),
            contact_console = self.shared.options.contact_console,
            "Started agent runtime"
        );
        Ok(())
    }

    /// Stop scheduling, give in-flight work the grace period, then abort
    /// what remains and flush the queue.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let was_running = {
            let mut running = self.running.write();
            std::mem::replace(&mut *running, false)
        };
        self.shared.set_state(RuntimeState::ShuttingDown);
        if !was_running {
            self.shared.queue.flush()?;
            return Ok(());
        }

        self.stop.send_replace(true);
        let grace = self.shared.store.settings().shutdown_grace_period();
        let deadline = Instant::now() + grace;

        let workers = std::mem::take(&mut *self.workers.write());
        let retiring: Vec<RoleUnit> = {
            let mut units = self.units.lock();
            std::mem::take(&mut *units).into_values().collect()
        };

        let worker_waits = workers
            .into_iter()
            .map(|handle| units::join_until(handle, deadline, "worker".to_string()));
        let unit_waits = retiring
            .into_iter()
            .map(|unit| units::retire(unit, deadline));
        futures::future::join_all(worker_waits).await;
        futures::future::join_all(unit_waits).await;

        self.shared.queue.flush()?;
        info!(
            pending = self.shared.queue.len(),
            grace_secs = grace.as_secs(),
            "Stopped agent runtime"
        );
        Ok(())
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), AgentError>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        info!("Shutdown requested");
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests;
