mod common;

use std::time::Duration;

use common::{eventually, start};
use dsflow::message::FlowMessage;
use serde_json::json;

const EVENT_FLOW: &str = r#"
id: events
servers:
  ds:
    host: memory
steps:
  a:
    type: event_subscribe
    server: ds
    event: topicX
  b:
    type: event_subscribe
    server: ds
    event: topicX
  shout:
    type: event_emit
    server: ds
    event: out
  watch:
    type: event_subscribe
    server: ds
    event: out
"#;

#[tokio::test]
async fn one_event_reaches_each_subscriber_once() {
    let mut h = start(EVENT_FLOW).await;
    // both steps share one backend listener
    assert_eq!(h.server.event_listeners("topicX"), 1);

    assert_eq!(h.server.emit("topicX", json!(42)), 1);
    let seen = h.drain(Duration::from_millis(200)).await;
    for step in ["a", "b"] {
        let got: Vec<_> = seen.iter().filter(|(id, _)| id == step).collect();
        assert_eq!(got.len(), 1, "step {step} got {got:?}");
        assert_eq!(got[0].1.payload, json!(42));
        assert_eq!(got[0].1.topic, None);
    }
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_deliveries() {
    let mut h = start(EVENT_FLOW).await;
    h.runtime.shutdown().await;

    assert_eq!(h.server.emit("topicX", json!(1)), 0);
    assert_eq!(h.server.live_clients(), 0);
    assert!(h.drain(Duration::from_millis(100)).await.is_empty());
}

#[tokio::test]
async fn emit_uses_topic_over_configured_event_and_forwards() {
    let mut h = start(EVENT_FLOW).await;

    h.runtime.inject("shout", FlowMessage::new(json!("hello"))).unwrap();
    let forwarded = h.next_from("shout").await;
    assert_eq!(forwarded.payload, json!("hello"));
    assert_eq!(h.next_from("watch").await.payload, json!("hello"));

    h.runtime
        .inject("shout", FlowMessage::new(json!(7)).with_topic("topicX"))
        .unwrap();
    let seen = h.drain(Duration::from_millis(200)).await;
    assert!(seen.iter().any(|(id, m)| id == "a" && m.payload == json!(7)));
    assert!(!seen.iter().any(|(id, _)| id == "watch"));
    h.runtime.shutdown().await;
}

const CHAT_EVENTS: &str = r#"
id: chat-events
servers:
  ds:
    host: memory
steps:
  inbox:
    type: message_receive
    server: ds
    uri: u1
    appName: app1
    method: say
  listen:
    type: message_listener
    server: ds
    event: sessions
    release_channel: sessions-gone
"#;

#[tokio::test]
async fn app_messages_carry_the_sender_uid() {
    let mut h = start(CHAT_EVENTS).await;
    assert_eq!(h.server.emit("u1/app1/say", json!({"uid": "42", "text": "hey"})), 1);

    let msg = h.next_from("inbox").await;
    assert_eq!(msg.payload["text"], json!("hey"));
    assert_eq!(msg.uid, Some(json!("42")));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn listener_follows_each_user_once_until_released() {
    let mut h = start(CHAT_EVENTS).await;
    let server = h.server.clone();

    server.emit("sessions", json!("7"));
    server.emit("sessions", json!("7"));
    eventually("session watcher", || server.record_watchers("user/7") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.record_watchers("user/7"), 1);

    server.set_record("user/7", Some("chat.messages"), json!(["hi"]));
    let seen = h.drain(Duration::from_millis(200)).await;
    let got: Vec<_> = seen.iter().filter(|(id, _)| id == "listen").collect();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1.payload, json!(["hi"]));
    assert_eq!(got[0].1.uid, Some(json!("7")));

    server.emit("sessions-gone", json!("7"));
    eventually("watcher released", || server.record_watchers("user/7") == 0).await;
    server.set_record("user/7", Some("chat.messages"), json!(["again"]));
    assert!(h.drain(Duration::from_millis(100)).await.is_empty());

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn announcements_without_uid_are_ignored() {
    let mut h = start(CHAT_EVENTS).await;
    h.server.emit("sessions", json!({"not": "a uid"}));
    h.server.emit("sessions", json!(null));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.drain(Duration::from_millis(50)).await.is_empty());
    assert!(h.reporter.errors("listen").is_empty());
    h.runtime.shutdown().await;
}
