//! Results produced while the console is unreachable are replayed in order.

mod support;

use reflex_agent::queue::ActionKind;
use reflex_agent::runtime::{RuntimeOptions, RuntimeState};
use serde_json::{json, Value};
use support::{load, paired_identity, AGENT_ID};
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn configure_poller(loaded: &reflex_agent::config::LoadedConfig) {
    loaded.store.set("roles", "poller").unwrap();
    loaded
        .store
        .set("role_configs", r#"{"poller":{"inputs":["syslog","edr"]}}"#)
        .unwrap();
}

async fn delivered_inputs(server: &MockServer) -> Vec<String> {
    let results_path = format!("/agents/{}/results", AGENT_ID);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == results_path)
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            assert_eq!(body["role"], "poller");
            body["data"]["input"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn results_survive_console_outage() {
    let server = MockServer::start().await;
    Mock::given(path_regex(r"^/agents/.*"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let loaded = load(&dir);
    loaded.store.save_identity(paired_identity(&server.uri())).unwrap();
    configure_poller(&loaded);
    let runtime = support::runtime(&loaded, RuntimeOptions::default());

    let report = runtime.run_cycle().await.unwrap();
    assert!(report.heartbeat_error.is_some());
    assert_eq!(report.roles_run, vec!["poller".to_string()]);
    assert_eq!(runtime.state(), RuntimeState::Offline);
    let kinds: Vec<ActionKind> = runtime
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
            ActionKind::StatusUpdate
        ]
    );

    server.reset().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/agents/.*/(heartbeat|results|status)$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let report = runtime.run_cycle().await.unwrap();
    assert!(report.heartbeat_error.is_none());
    assert_eq!(runtime.state(), RuntimeState::Connected);
    assert_eq!(report.drained.delivered, 7);
    assert_eq!(report.drained.dead_lettered, 0);
    assert_eq!(report.queue_depth, 0);
    assert_eq!(
        delivered_inputs(&server).await,
        vec!["syslog", "edr", "syslog", "edr"]
    );
}

#[tokio::test]
async fn offline_mode_queues_until_an_online_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    {
        let loaded = load(&dir);
        loaded.store.save_identity(paired_identity(&server.uri())).unwrap();
        configure_poller(&loaded);
        let runtime = support::runtime(&loaded, RuntimeOptions::offline());
        let report = runtime.run_cycle().await.unwrap();
        assert_eq!(report.queue_depth, 3);
        runtime.queue().flush().unwrap();
    }
    assert!(server
        .received_requests()
        .await
        .unwrap_or_default()
        .is_empty());

    // a later process reopens the same queue and delivers the backlog first
    let loaded = load(&dir);
    let runtime = support::runtime(&loaded, RuntimeOptions::default());
    assert_eq!(runtime.queue().len(), 3);
    let report = runtime.run_cycle().await.unwrap();
    assert_eq!(report.drained.delivered, 6);
    assert_eq!(
        delivered_inputs(&server).await,
        vec!["syslog", "edr", "syslog", "edr"]
    );
}

#[tokio::test]
async fn undeliverable_results_are_dead_lettered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/agents/{}/results", AGENT_ID).as_str()))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"error": "schema"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/agents/.*/(heartbeat|status)$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let loaded = load(&dir);
    loaded.store.save_identity(paired_identity(&server.uri())).unwrap();
    configure_poller(&loaded);
    loaded.store.set("max_delivery_attempts", "1").unwrap();

    {
        let offline = support::runtime(&loaded, RuntimeOptions::offline());
        offline.run_cycle().await.unwrap();
        offline.queue().flush().unwrap();
    }

    let runtime = support::runtime(&loaded, RuntimeOptions::default());
    runtime.heartbeat_once().await.unwrap();
    let report = runtime.drain_queue().await.unwrap();
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);

    let dead = runtime.queue().dead_letters().unwrap();
    assert_eq!(dead.len(), 2);
    assert!(dead
        .iter()
        .all(|d| d.action.kind == ActionKind::RoleResult && d.action.last_error.is_some()));
}
