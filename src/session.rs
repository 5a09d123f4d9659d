//! Session coordination: the app registry in `chat/apps` and the per-user session records.
//!
//! An app switch reads the registry entry at `<uri>.<appName>` and the user's session record
//! concurrently, and only once both are ready replaces the session's `chat.config` with the
//! full entry and queues the entry's greeting in `chat.returnMsg`.

use std::future::Future;

use ds_client::{ClientError, DsClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::StepError;

pub const APPS_RECORD: &str = "chat/apps";
pub const CONFIG_PATH: &str = "chat.config";
pub const RETURN_MSG_PATH: &str = "chat.returnMsg";
pub const SOCKET_PATH: &str = "chat.config.socket";

/// One app as registered in `chat/apps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(rename = "externalUrl", alias = "external_url", default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AppEntry {
    pub fn key(&self) -> String {
        app_key(&self.uri, &self.name)
    }
}

/// Registry path of an app.
pub fn app_key(uri: &str, app_name: &str) -> String {
    format!("{uri}.{app_name}")
}

/// Resolves once both readiness futures have, failing as soon as either fails.
pub async fn both_ready<A, B, T, U, E>(first: A, second: B) -> Result<(T, U), E>
where
    A: Future<Output = Result<T, E>>,
    B: Future<Output = Result<U, E>>,
{
    futures::future::try_join(first, second).await
}

fn is_absent(entry: &Value) -> bool {
    match entry {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// `{type: "message", content, say}` built from the entry's `message`.
pub fn greeting(entry: &Value) -> Value {
    let message = entry.get("message").cloned().unwrap_or(Value::Null);
    json!({"type": "message", "content": message.clone(), "say": message})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    /// No entry for the key; the session was not touched.
    Missing(String),
}

/// What an app switch needs besides the client.
#[derive(Debug, Clone, Default)]
pub struct SwitchRequest {
    pub session: String,
    pub app_key: String,
    /// Also written to `chat.config.socket` after the copy.
    pub socket: Option<String>,
    /// Queue the app greeting in `chat.returnMsg`.
    pub greet: bool,
    pub strict: bool,
}

/// Copies the registry entry into the session once both records are ready.
pub async fn switch_app(client: &dyn DsClient, req: &SwitchRequest) -> Result<SwitchOutcome, StepError> {
    let (entry, _session) = both_ready(
        client.record_get(APPS_RECORD, Some(&req.app_key)),
        client.record_snapshot(&req.session),
    )
    .await?;

    if is_absent(&entry) {
        if req.strict {
            return Err(StepError::LookupMiss(req.app_key.clone()));
        }
        debug!(app = %req.app_key, session = %req.session, "no such app, session left untouched");
        return Ok(SwitchOutcome::Missing(req.app_key.clone()));
    }

    let returned = if req.greet { Some(greeting(&entry)) } else { None };
    client.record_set(&req.session, Some(CONFIG_PATH), entry).await?;
    if let Some(returned) = returned {
        client.record_set(&req.session, Some(RETURN_MSG_PATH), returned).await?;
    }
    if let Some(socket) = &req.socket {
        client.record_set(&req.session, Some(SOCKET_PATH), Value::String(socket.clone())).await?;
    }
    info!(app = %req.app_key, session = %req.session, "session switched");
    Ok(SwitchOutcome::Switched)
}

/// A reply written into a session, optionally handing the session over to another app.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub session: String,
    pub payload: Value,
    pub socket: Option<String>,
    pub next_app: Option<String>,
    pub strict: bool,
}

pub async fn send_message(client: &dyn DsClient, delivery: Delivery) -> Result<Option<SwitchOutcome>, StepError> {
    client
        .record_set(&delivery.session, Some(RETURN_MSG_PATH), delivery.payload)
        .await?;
    if let Some(socket) = &delivery.socket {
        client
            .record_set(&delivery.session, Some(SOCKET_PATH), Value::String(socket.clone()))
            .await?;
    }
    let Some(app_key) = delivery.next_app else {
        return Ok(None);
    };
    let req = SwitchRequest {
        session: delivery.session,
        app_key,
        socket: delivery.socket,
        greet: false,
        strict: delivery.strict,
    };
    switch_app(client, &req).await.map(Some)
}

/// Publishes the entry at its key in `chat/apps`.
pub async fn register_app(client: &dyn DsClient, entry: &AppEntry) -> Result<(), ClientError> {
    let value = serde_json::to_value(entry).map_err(|e| ClientError::Other(e.to_string()))?;
    client.record_set(APPS_RECORD, Some(&entry.key()), value).await?;
    info!(app = %entry.key(), "app registered");
    Ok(())
}
