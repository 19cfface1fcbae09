//! Role units and their supervisor.

use super::{Dispatcher, RuntimeShared, ROLE_SOURCE};
use crate::error::RoleError;
use crate::queue::ActionKind;
use crate::role::{ActionSink, RoleContext, RoleInstance, RoleRegistry, RoleResult};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Time a unit gets to observe cancellation once its grace period is over.
const CANCEL_WAIT: Duration = Duration::from_millis(250);

/// A scheduled role.
pub(crate) struct RoleUnit {
    name: String,
    config: Value,
    cadence: Duration,
    timeout: Duration,
    /// Stops scheduling new invocations
    stop: watch::Sender<bool>,
    /// Cancels the invocation in flight
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RoleUnit {
    fn matches(&self, instance: &RoleInstance) -> bool {
        self.config == instance.config
            && self.cadence == instance.cadence
            && self.timeout == instance.timeout
    }
}

/// Run a role once under its timeout and submit what it produced.
///
/// Returns the number of results submitted. Failures and timeouts are
/// recorded as health issues until the role next succeeds.
pub(crate) async fn invoke(
    shared: &RuntimeShared,
    sink: &Arc<Dispatcher>,
    instance: &RoleInstance,
    cancel: watch::Receiver<bool>,
) -> Result<usize, RoleError> {
    let submitter: Arc<dyn ActionSink> = Arc::clone(sink) as Arc<dyn ActionSink>;
    let ctx = RoleContext::new(
        instance.name.as_str(),
        shared.store.identity(),
        instance.config.clone(),
        submitter,
        cancel,
    );

    let started = Instant::now();
    let outcome = match tokio::time::timeout(instance.timeout, instance.role.run(ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RoleError::Timeout(instance.timeout)),
    };

    let source = format!("{}{}", ROLE_SOURCE, instance.name);
    match outcome {
        Ok(result) => {
            shared.health.clear(&source);
            let submitted = submit_result(sink.as_ref(), &instance.name, result).await;
            debug!(
                role = %instance.name,
                submitted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Role invocation finished"
            );
            Ok(submitted)
        }
        Err(e) => {
            warn!(role = %instance.name, error = %e, "Role invocation failed");
            shared
                .health
                .record(source, format!("role {}: {}", instance.name, e));
            Err(e)
        }
    }
}

async fn submit_result(sink: &Dispatcher, role: &str, result: RoleResult) -> usize {
    let mut submitted = 0;
    for output in result.outputs {
        match sink.submit(ActionKind::RoleResult, envelope(role, output)).await {
            Ok(_) => submitted += 1,
            Err(e) => error!(role = %role, error = %e, "Failed to submit role result"),
        }
    }
    if let Some(status) = result.status {
        if let Err(e) = sink.submit(ActionKind::StatusUpdate, envelope(role, status)).await {
            error!(role = %role, error = %e, "Failed to submit role status");
        }
    }
    submitted
}

fn envelope(role: &str, data: Value) -> Value {
    json!({
        "role": role,
        "produced_at": Utc::now().to_rfc3339(),
        "data": data,
    })
}

async fn role_loop(
    shared: Arc<RuntimeShared>,
    sink: Arc<Dispatcher>,
    instance: RoleInstance,
    mut stop: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
) {
    debug!(role = %instance.name, "Role unit started");
    let mut ticker = tokio::time::interval(instance.cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }
        let _ = invoke(&shared, &sink, &instance, cancel.clone()).await;
    }
    debug!(role = %instance.name, "Role unit stopped");
}

fn spawn_unit(shared: &Arc<RuntimeShared>, sink: &Arc<Dispatcher>, instance: RoleInstance) -> RoleUnit {
    let (stop, stop_rx) = watch::channel(false);
    let (cancel, cancel_rx) = watch::channel(false);
    let name = instance.name.clone();
    let config = instance.config.clone();
    let cadence = instance.cadence;
    let timeout = instance.timeout;
    let handle = tokio::spawn(role_loop(
        Arc::clone(shared),
        Arc::clone(sink),
        instance,
        stop_rx,
        cancel_rx,
    ));
    RoleUnit {
        name,
        config,
        cadence,
        timeout,
        stop,
        cancel,
        handle,
    }
}

/// Wait for a task until `deadline`, aborting it afterwards.
pub(crate) async fn join_until(mut handle: JoinHandle<()>, deadline: Instant, label: String) {
    if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
        handle.abort();
        warn!(unit = %label, "Unit aborted after grace period");
    }
}

/// Stop a role unit: no new invocations, the one in flight may finish until
/// `deadline`, then it is cancelled and finally aborted.
pub(crate) async fn retire(mut unit: RoleUnit, deadline: Instant) {
    let _ = unit.stop.send(true);
    if tokio::time::timeout_at(deadline, &mut unit.handle).await.is_ok() {
        return;
    }
    let _ = unit.cancel.send(true);
    if tokio::time::timeout(CANCEL_WAIT, &mut unit.handle).await.is_err() {
        unit.handle.abort();
        warn!(role = %unit.name, "Role unit aborted after grace period");
    }
}

/// Bring running units in line with the effective configuration.
fn reconcile(
    shared: &Arc<RuntimeShared>,
    sink: &Arc<Dispatcher>,
    registry: &RoleRegistry,
    units: &Mutex<BTreeMap<String, RoleUnit>>,
    stop: &watch::Receiver<bool>,
) {
    let settings = shared.store.settings();
    shared.queue.set_max_attempts(settings.max_delivery_attempts);
    let activation = registry.activate(&settings.roles, &settings);
    shared.health.replace_activation(&activation.diagnostics);

    let mut units = units.lock();
    if *stop.borrow() {
        return;
    }

    let stale: Vec<String> = units
        .iter()
        .filter(|(name, unit)| activation.get(name).map_or(true, |i| !unit.matches(i)))
        .map(|(name, _)| name.clone())
        .collect();
    let deadline = Instant::now() + settings.shutdown_grace_period();
    for name in stale {
        if let Some(unit) = units.remove(&name) {
            info!(role = %name, "Stopping role unit");
            shared.health.clear(&format!("{}{}", ROLE_SOURCE, name));
            tokio::spawn(retire(unit, deadline));
        }
    }

    for instance in activation.instances {
        if units.contains_key(&instance.name) {
            continue;
        }
        info!(
            role = %instance.name,
            version = %instance.version,
            cadence_secs = instance.cadence.as_secs(),
            "Starting role unit"
        );
        let name = instance.name.clone();
        units.insert(name, spawn_unit(shared, sink, instance));
    }
}

pub(crate) async fn supervise(
    shared: Arc<RuntimeShared>,
    sink: Arc<Dispatcher>,
    registry: Arc<RoleRegistry>,
    units: Arc<Mutex<BTreeMap<String, RoleUnit>>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut changes = shared.store.subscribe();
    let _ = changes.borrow_and_update();
    reconcile(&shared, &sink, &registry, &units, &stop);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }
        debug!("Configuration changed, reconciling role units");
        reconcile(&shared, &sink, &registry, &units, &stop);
    }
    debug!("Role supervisor stopped");
}
