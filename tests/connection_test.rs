mod common;

use std::time::Duration;

use common::{eventually, parse, start, start_flow};
use ds_client::MemoryServer;
use dsflow::config::{ConfigManager, MapConfigManager, PASSWORD_KEY, USER_KEY};
use dsflow::connection::LinkState;
use serde_json::json;
use tokio::time::{Instant, sleep};

const FLOW: &str = r#"
id: shared
servers:
  ds:
    host: memory
steps:
  sub:
    type: event_subscribe
    server: ds
    event: topicX
  provide:
    type: rpc_provide
    server: ds
    method: sum
  inbox:
    type: message_receive
    server: ds
    uri: u1
    appName: app1
    method: say
  register:
    type: message_app
    server: ds
    name: app1
    uri: u1
  get:
    type: record_get
    server: ds
    record: profile
"#;

/// Waits (in virtual time) until `server` has seen `n` connect attempts.
async fn attempts(server: &MemoryServer, n: usize) -> Vec<Instant> {
    for _ in 0..1_000 {
        let seen = server.connect_attempts();
        if seen.len() >= n {
            return seen;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("expected {n} connect attempts, saw {}", server.connect_attempts().len());
}

#[tokio::test(start_paused = true)]
async fn all_steps_share_one_connection() {
    let h = start(FLOW).await;
    let server = h.server.clone();
    eventually("provider", || server.providers("sum") == 1).await;

    assert_eq!(server.connect_attempts().len(), 1);
    assert_eq!(server.login_count(), 1);
    assert_eq!(server.live_clients(), 1);

    let link = h.connections.get("ds").unwrap();
    assert_eq!(link.lease_count(), 5);
    assert_eq!(link.state(), LinkState::Open);

    h.runtime.shutdown().await;
    assert_eq!(link.lease_count(), 0);
    assert_eq!(server.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_error_reconnects_after_five_seconds() {
    let mut h = start(FLOW).await;
    let server = h.server.clone();
    eventually("provider", || server.providers("sum") == 1).await;

    let failed_at = Instant::now();
    server.fail_transport("socket hang up");
    let seen = attempts(&server, 2).await;
    assert_eq!(seen[1] - failed_at, Duration::from_secs(5));

    // subscriptions and registrations come back on the new connection
    eventually("event listener", || server.event_listeners("topicX") == 1).await;
    eventually("provider", || server.providers("sum") == 1).await;
    assert_eq!(server.live_clients(), 1);

    server.emit("topicX", json!(42));
    assert_eq!(h.next_from("sub").await.payload, json!(42));

    let statuses = h.reporter.statuses("sub");
    assert!(statuses.iter().any(|s| s.starts_with("error - ")), "{statuses:?}");
    assert_eq!(statuses.last().map(String::as_str), Some("connected"));

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_reconnects_keep_the_fixed_delay() {
    let h = start(FLOW).await;
    let server = h.server.clone();
    eventually("provider", || server.providers("sum") == 1).await;

    server.refuse_connections(true);
    server.fail_transport("gone");
    let seen = attempts(&server, 4).await;
    for pair in seen[1..].windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
    }
    assert_eq!(server.live_clients(), 0);

    server.refuse_connections(false);
    let seen = attempts(&server, 5).await;
    assert_eq!(seen[4] - seen[3], Duration::from_secs(5));
    eventually("provider back", || server.providers("sum") == 1).await;
    assert_eq!(h.connections.get("ds").unwrap().state(), LinkState::Open);

    h.runtime.shutdown().await;
}

const LOGIN_FLOW: &str = r#"
id: login
servers:
  ds:
    host: memory
    credentials:
      username: bob
      password: wrong
steps:
  sub:
    type: event_subscribe
    server: ds
    event: topicX
"#;

#[tokio::test(start_paused = true)]
async fn rejected_login_is_reported_not_retried() {
    let server = MemoryServer::new();
    server.add_user("bob", "secret");
    let h = start_flow(server.clone(), parse(LOGIN_FLOW)).await;

    assert!(h.reporter.errors("sub").iter().any(|e| e.contains("login failed")));

    sleep(Duration::from_secs(30)).await;
    assert!(h.reporter.statuses("sub").iter().any(|s| s.starts_with("error - login failed")));
    assert_eq!(server.connect_attempts().len(), 1);
    assert_eq!(h.connections.get("ds").unwrap().state(), LinkState::LoginFailed);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn missing_credentials_come_from_configuration() {
    let server = MemoryServer::new();
    server.add_user("bob", "secret");

    let values = MapConfigManager::new();
    values.insert(USER_KEY, "bob");
    values.insert(PASSWORD_KEY, "secret");
    let config = ConfigManager(values);

    let mut flow = parse(&LOGIN_FLOW.replace("    credentials:\n      username: bob\n      password: wrong\n", ""));
    assert!(flow.servers()["ds"].credentials.is_none());
    flow.resolve_credentials(&config).await;

    let h = start_flow(server.clone(), flow).await;
    assert!(h.reporter.errors("sub").is_empty());
    assert_eq!(server.login_count(), 1);
    assert_eq!(h.connections.get("ds").unwrap().state(), LinkState::Open);
    h.runtime.shutdown().await;
}
