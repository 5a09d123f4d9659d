//! Event fan-out: plain channel subscriptions, app message channels and the per-user
//! message listener that follows `chat.messages` of every announced session.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ServerLink;
use crate::message::{session_record_for, FlowMessage};

pub const MESSAGES_PATH: &str = "chat.messages";

/// Channel an app receives its messages on: `<uri>/<appName>/<method>`.
pub fn app_channel(uri: &str, app_name: &str, method: &str) -> String {
    format!("{uri}/{app_name}/{method}")
}

/// Drains a dispatcher receiver into `emit` until cancelled or the channel is unbound.
pub async fn forward<F>(mut rx: broadcast::Receiver<Value>, cancel: CancellationToken, mut emit: F)
where
    F: FnMut(Value) + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rx.recv() => r,
        };
        match next {
            Ok(value) => emit(value),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event receiver lagged, payloads dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// `{payload, uid: payload.uid}` for a message addressed to an app.
pub fn app_message(data: Value) -> FlowMessage {
    let uid = data.get("uid").cloned().filter(|u| !u.is_null());
    let mut msg = FlowMessage::new(data);
    msg.uid = uid;
    msg
}

/// Identifier announced on a listener control channel, if usable.
pub fn announced_uid(data: &Value) -> Option<String> {
    match data {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Follows a record (or one of its paths), calling `emit` per change. The subscription is
/// re-opened after every reconnect until `cancel` fires.
pub async fn follow_record<F>(
    link: Arc<ServerLink>,
    record: String,
    path: Option<String>,
    cancel: CancellationToken,
    mut emit: F,
) where
    F: FnMut(Value) + Send,
{
    loop {
        let opened = link
            .open_with(&cancel, &record, |client| {
                let (record, path) = (record.clone(), path.clone());
                async move { client.record_subscribe(&record, path.as_deref()).await }
            })
            .await;
        let Some(mut sub) = opened else { return };
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                v = sub.recv() => v,
            };
            match next {
                Some(value) => emit(value),
                None => break,
            }
        }
        debug!(%record, "record subscription ended, re-opening");
    }
}

/// Nested `chat.messages` subscriptions, at most one per user.
#[derive(Debug)]
pub struct SessionListener {
    link: Arc<ServerLink>,
    cancel: CancellationToken,
    sessions: DashMap<String, CancellationToken>,
}

impl SessionListener {
    /// Subscriptions end when `cancel` fires.
    pub fn new(link: Arc<ServerLink>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self { link, cancel, sessions: DashMap::new() })
    }

    /// Starts following `user/<uid>` unless already followed. `true` when a subscription was added.
    pub fn listen<F>(&self, uid: &str, emit: F) -> bool
    where
        F: Fn(FlowMessage) + Send + 'static,
    {
        let token = match self.sessions.entry(uid.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(e) => e.insert(self.cancel.child_token()).clone(),
        };
        debug!(%uid, "following session messages");
        let owner = uid.to_string();
        tokio::spawn(follow_record(
            self.link.clone(),
            session_record_for(uid),
            Some(MESSAGES_PATH.to_string()),
            token,
            move |data| emit(FlowMessage::new(data).with_uid(owner.clone())),
        ));
        true
    }

    /// Stops following `uid`. `true` when it was followed.
    pub fn release(&self, uid: &str) -> bool {
        match self.sessions.remove(uid) {
            Some((_, token)) => {
                token.cancel();
                debug!(%uid, "stopped following session messages");
                true
            }
            None => false,
        }
    }

    pub fn followed(&self) -> usize {
        self.sessions.len()
    }

    /// Ends every subscription and forgets the followed users.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::ConnectionManager;
    use ds_client::MemoryServer;
    use serde_json::json;

    #[tokio::test]
    async fn shutdown_forgets_followed_sessions() {
        let server = MemoryServer::new();
        let manager = ConnectionManager::new(Arc::new(server.clone()));
        let link = manager.link(&Arc::new(ServerConfig::new("ds", "memory", 6020)));
        let cancel = CancellationToken::new();
        let listener = SessionListener::new(link, cancel.clone());

        assert!(listener.listen("7", |_| {}));
        assert!(!listener.listen("7", |_| {}));
        assert_eq!(listener.followed(), 1);

        listener.shutdown();
        assert_eq!(listener.followed(), 0);
        assert!(cancel.is_cancelled());
        manager.shutdown().await;
    }

    #[test]
    fn app_channel_layout() {
        assert_eq!(app_channel("u1", "app1", "say"), "u1/app1/say");
    }

    #[test]
    fn app_message_lifts_uid() {
        let msg = app_message(json!({"uid": 42, "text": "hi"}));
        assert_eq!(msg.uid, Some(json!(42)));
        assert_eq!(msg.payload["text"], json!("hi"));
        assert!(app_message(json!("plain")).uid.is_none());
    }

    #[test]
    fn announced_uid_accepts_strings_and_numbers() {
        assert_eq!(announced_uid(&json!("42")), Some("42".to_string()));
        assert_eq!(announced_uid(&json!(7)), Some("7".to_string()));
        assert_eq!(announced_uid(&json!(null)), None);
        assert_eq!(announced_uid(&json!("")), None);
        assert_eq!(announced_uid(&json!({"uid": 1})), None);
    }
}
