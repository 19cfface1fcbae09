use super::*;
use crate::config::CONFIG_FILE_NAME;
use crate::console::fake::FakeConsole;
use crate::console::AgentPolicy;
use crate::error::RoleError;
use crate::pairing::PairingToken;
use crate::queue::ActionKind;
use crate::role::{Role, RoleContext, RoleDescriptor, RoleResult, StaticDiscovery};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

struct Emitter {
    seq: Arc<AtomicUsize>,
}

#[async_trait]
impl Role for Emitter {
    async fn run(&self, _ctx: RoleContext) -> Result<RoleResult, RoleError> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RoleResult {
            outputs: vec![json!({ "seq": n })],
            status: None,
        })
    }
}

struct Sleeper;

#[async_trait]
impl Role for Sleeper {
    async fn run(&self, mut ctx: RoleContext) -> Result<RoleResult, RoleError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(RoleResult::default()),
            _ = ctx.cancelled() => Err(RoleError::Cancelled),
        }
    }
}

struct Quiet;

#[async_trait]
impl Role for Quiet {
    async fn run(&self, _ctx: RoleContext) -> Result<RoleResult, RoleError> {
        Ok(RoleResult::default())
    }
}

fn registry(seq: Arc<AtomicUsize>) -> RoleRegistry {
    let discovery = StaticDiscovery(vec![
        RoleDescriptor::new("emitter", "1.0.0", "emits a sequence number", move |_| {
            Ok(Arc::new(Emitter {
                seq: Arc::clone(&seq),
            }) as Arc<dyn Role>)
        }),
        RoleDescriptor::new("sleeper", "1.0.0", "never finishes", |_| {
            Ok(Arc::new(Sleeper) as Arc<dyn Role>)
        }),
        RoleDescriptor::new("quiet", "1.0.0", "produces nothing", |_| {
            Ok(Arc::new(Quiet) as Arc<dyn Role>)
        }),
    ]);
    RoleRegistry::discover(&[&discovery])
}

fn identity() -> AgentIdentity {
    AgentIdentity {
        agent_id: "agent-0001".to_string(),
        console_url: "https://console.example.test".to_string(),
        pairing_token: PairingToken::new("good-token"),
        groups: BTreeSet::new(),
        paired_at: Utc::now(),
        status: PairingStatus::Paired,
    }
}

struct Harness {
    _dir: TempDir,
    console: Arc<FakeConsole>,
    store: Arc<ConfigStore>,
    seq: Arc<AtomicUsize>,
    runtime: AgentRuntime,
}

fn harness(roles: &str, options: RuntimeOptions, paired: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ConfigStore::open(dir.path().join(CONFIG_FILE_NAME), Vec::new()).unwrap());
    store.set("roles", roles).unwrap();
    if paired {
        store.save_identity(identity()).unwrap();
    }
    let console = Arc::new(FakeConsole::new("good-token"));
    let client: Arc<dyn ConsoleClient> = console.clone();
    let pairing = Arc::new(PairingMachine::new(Arc::clone(&store), Arc::clone(&client)));
    let queue = Arc::new(DurableQueue::open(&dir.path().join("queue"), 10).unwrap());
    let seq = Arc::new(AtomicUsize::new(0));
    let runtime = AgentRuntime::new(
        Arc::clone(&store),
        pairing,
        client,
        queue,
        registry(Arc::clone(&seq)),
        options,
    );
    Harness {
        _dir: dir,
        console,
        store,
        seq,
        runtime,
    }
}

fn sequence_numbers(console: &FakeConsole) -> Vec<u64> {
    console
        .delivered_payloads(ActionKind::RoleResult)
        .iter()
        .filter_map(|p| p["data"]["seq"].as_u64())
        .collect()
}

#[tokio::test]
async fn test_new_runtime_is_idle() {
    let h = harness("", RuntimeOptions::default(), true);
    assert_eq!(h.runtime.state(), RuntimeState::Idle);
}

#[tokio::test]
async fn test_offline_results_replay_in_order_after_reconnect() {
    let h = harness("emitter", RuntimeOptions::default(), true);
    h.console.set_reachable(false);

    for _ in 0..3 {
        let report = h.runtime.run_cycle().await.unwrap();
        assert!(report.heartbeat_error.is_some());
        assert_eq!(report.roles_run, vec!["emitter".to_string()]);
    }
    assert_eq!(h.runtime.state(), RuntimeState::Offline);

    let kinds: Vec<ActionKind> = h
        .runtime
        .queue()
        .pending()
        .unwrap()
        .iter()
        .map(|a| a.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::Heartbeat,
            ActionKind::RoleResult,
            ActionKind::RoleResult,
            ActionKind::RoleResult,
        ]
    );
    assert!(h.console.deliveries.lock().is_empty());

    h.console.set_reachable(true);
    let report = h.runtime.run_cycle().await.unwrap();
    assert!(matches!(
        report.heartbeat,
        Some(HeartbeatOutcome::Delivered { .. })
    ));
    assert_eq!(h.runtime.state(), RuntimeState::Connected);
    assert_eq!(report.drained.delivered, 5);
    assert_eq!(report.queue_depth, 0);
    assert_eq!(sequence_numbers(&h.console), vec![1, 2, 3, 4]);
    assert_eq!(h.console.delivered_payloads(ActionKind::Heartbeat).len(), 1);
}

#[tokio::test]
async fn test_connected_with_empty_queue_sends_directly() {
    let h = harness("emitter", RuntimeOptions::default(), true);

    let report = h.runtime.run_cycle().await.unwrap();
    assert_eq!(
        report.heartbeat,
        Some(HeartbeatOutcome::Delivered {
            policy_changed: false
        })
    );
    assert_eq!(report.drained.delivered, 0);
    assert_eq!(report.queue_depth, 0);
    assert_eq!(sequence_numbers(&h.console), vec![1]);
    assert_eq!(h.console.heartbeats.lock().len(), 1);
}

#[tokio::test]
async fn test_offline_mode_never_contacts_console() {
    let h = harness("emitter", RuntimeOptions::offline(), true);

    assert!(matches!(
        h.runtime.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Deferred(crate::role::Submission::Queued(_))
    ));
    assert_eq!(
        h.runtime.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Deferred(crate::role::Submission::Coalesced)
    );

    let report = h.runtime.run_cycle().await.unwrap();
    assert!(report.heartbeat.is_none());
    assert_eq!(report.queue_depth, 2);
    assert_eq!(h.runtime.state(), RuntimeState::Idle);

    let drained = h.runtime.drain_queue().await.unwrap();
    assert_eq!(drained.delivered, 0);
    assert_eq!(drained.remaining, 2);
    assert!(h.console.heartbeats.lock().is_empty());
    assert!(h.console.deliveries.lock().is_empty());
}

#[tokio::test]
async fn test_missing_role_is_reported_and_others_still_run() {
    let h = harness("emitter,ghost", RuntimeOptions::offline(), true);

    let report = h.runtime.run_cycle().await.unwrap();
    assert_eq!(report.roles_run, vec!["emitter".to_string()]);
    assert_eq!(
        h.runtime.health_issues(),
        vec!["Role \"ghost\" not installed in agent library".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_role_timeout_is_reported_in_heartbeat() {
    let h = harness("sleeper,emitter", RuntimeOptions::default(), true);
    h.store.set("role_timeout", "5").unwrap();

    let report = h.runtime.run_cycle().await.unwrap();
    assert_eq!(report.roles_run, vec!["emitter".to_string()]);
    assert_eq!(report.role_failures.len(), 1);
    assert_eq!(report.role_failures[0].0, "sleeper");

    h.runtime.heartbeat_once().await.unwrap();
    let heartbeats = h.console.heartbeats.lock();
    let last = heartbeats.last().unwrap();
    assert!(!last.healthy);
    assert_eq!(last.health_issues.len(), 1);
    assert!(last.health_issues[0].contains("sleeper"));
}

#[tokio::test]
async fn test_rejected_credentials_revoke_pairing() {
    let h = harness("", RuntimeOptions::default(), true);
    h.console.set_revoked(true);

    assert!(matches!(
        h.runtime.heartbeat_once().await,
        Err(AgentError::Revoked)
    ));
    assert_eq!(
        h.store.identity().unwrap().status,
        PairingStatus::Revoked
    );

    // Revoked agents stay quiet even once the console would accept them
    h.console.set_revoked(false);
    assert!(matches!(
        h.runtime.heartbeat_once().await,
        Err(AgentError::Revoked)
    ));
    assert!(h.console.heartbeats.lock().is_empty());
    assert!(matches!(h.runtime.start(), Err(AgentError::Revoked)));
}

#[tokio::test]
async fn test_refused_heartbeat_is_reported_as_health_issue() {
    let h = harness("", RuntimeOptions::default(), true);
    h.console.set_refusal(Some(404));

    assert!(matches!(
        h.runtime.heartbeat_once().await,
        Err(AgentError::Console(ConsoleError::Status { status: 404, .. }))
    ));
    assert_eq!(h.runtime.state(), RuntimeState::Idle);
    assert!(h.runtime.queue().is_empty());
    let issues = h.runtime.health_issues();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].contains("404"));
    assert_eq!(
        h.store.identity().unwrap().status,
        PairingStatus::Paired
    );

    h.console.set_refusal(None);
    h.runtime.heartbeat_once().await.unwrap();
    assert_eq!(h.runtime.state(), RuntimeState::Connected);
    assert!(h.runtime.health_issues().is_empty());
}

#[tokio::test]
async fn test_policy_is_applied_once_per_revision() {
    let h = harness("", RuntimeOptions::default(), true);
    let settings = json!({
        "health_check_interval": 45,
        "max_delivery_attempts": 4,
        "bogus": 1,
    });
    *h.console.policy.lock() = Some(AgentPolicy {
        revision: 3,
        uuid: "policy-a".to_string(),
        settings: settings.as_object().unwrap().clone(),
    });

    assert_eq!(
        h.runtime.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Delivered {
            policy_changed: true
        }
    );
    assert_eq!(h.store.settings().health_check_interval, 45);
    assert_eq!(h.runtime.queue().max_attempts(), 4);
    assert_eq!(h.store.snapshot().policy.as_ref().unwrap().revision, 3);

    assert_eq!(
        h.runtime.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Delivered {
            policy_changed: false
        }
    );
}

#[tokio::test]
async fn test_start_requires_pairing() {
    let h = harness("emitter", RuntimeOptions::default(), false);
    assert!(matches!(h.runtime.start(), Err(AgentError::NotPaired)));
    assert!(matches!(
        h.runtime.heartbeat_once().await,
        Err(AgentError::NotPaired)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_started_runtime_runs_roles_until_shutdown() {
    let h = harness("emitter", RuntimeOptions::default(), true);
    h.runtime.start().unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(h.runtime.state(), RuntimeState::Connected);
    assert_eq!(h.runtime.active_roles(), vec!["emitter".to_string()]);
    assert!(h.seq.load(Ordering::SeqCst) >= 2);

    h.runtime.shutdown().await.unwrap();
    assert_eq!(h.runtime.state(), RuntimeState::ShuttingDown);
    assert!(h.runtime.active_roles().is_empty());

    // Every result is either delivered or still queued
    let queued = h
        .runtime
        .queue()
        .pending()
        .unwrap()
        .iter()
        .filter(|a| a.kind == ActionKind::RoleResult)
        .count();
    assert_eq!(
        sequence_numbers(&h.console).len() + queued,
        h.seq.load(Ordering::SeqCst)
    );
}

#[tokio::test(start_paused = true)]
async fn test_role_units_follow_configuration_changes() {
    let h = harness("emitter", RuntimeOptions::default(), true);
    h.runtime.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.runtime.active_roles(), vec!["emitter".to_string()]);

    h.store.set("roles", "quiet,ghost").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.runtime.active_roles(), vec!["quiet".to_string()]);
    assert!(h
        .runtime
        .health_issues()
        .iter()
        .any(|issue| issue.contains("ghost")));

    h.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_roles_after_grace_period() {
    let h = harness("sleeper", RuntimeOptions::default(), true);
    h.store.set("shutdown_grace_period", "3").unwrap();
    h.runtime.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    h.runtime.shutdown().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_runtime_cannot_restart() {
    let h = harness("emitter", RuntimeOptions::default(), true);
    h.runtime.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.runtime.shutdown().await.unwrap();
    let produced = h.seq.load(Ordering::SeqCst);

    assert!(matches!(h.runtime.start(), Err(AgentError::ShutDown)));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.runtime.active_roles().is_empty());
    assert_eq!(h.seq.load(Ordering::SeqCst), produced);
    assert_eq!(h.runtime.state(), RuntimeState::ShuttingDown);
}

#[tokio::test]
async fn test_start_after_shutdown_of_idle_runtime_is_rejected() {
    let h = harness("emitter", RuntimeOptions::default(), true);
    h.runtime.shutdown().await.unwrap();
    assert!(matches!(h.runtime.start(), Err(AgentError::ShutDown)));
}
