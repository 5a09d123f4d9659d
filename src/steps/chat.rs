use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StepError;
use crate::message::{FlowMessage, session_record_for};
use crate::session::{self, AppEntry, Delivery, SwitchOutcome, SwitchRequest};
use crate::step::{StepContext, StepType};

/// Picks `(uri, name)` from the message first, then from the step config.
fn target_key(
    msg_uri: Option<&String>,
    msg_name: Option<&String>,
    uri: Option<&String>,
    name: Option<&String>,
) -> Result<Option<String>, StepError> {
    let non_empty = |v: Option<&String>| v.filter(|s| !s.is_empty()).cloned();
    let uri = non_empty(msg_uri).or_else(|| non_empty(uri));
    let name = non_empty(msg_name).or_else(|| non_empty(name));
    match (uri, name) {
        (Some(uri), Some(name)) => Ok(Some(session::app_key(&uri, &name))),
        (None, None) => Ok(None),
        (Some(uri), None) => Err(StepError::InvalidInput(format!("app uri {uri} given without an app name"))),
        (None, Some(name)) => Err(StepError::InvalidInput(format!("app name {name} given without a uri"))),
    }
}

fn report_outcome(ctx: &StepContext, outcome: &SwitchOutcome) {
    if let SwitchOutcome::Missing(key) = outcome {
        debug!(step = %ctx.step_id(), app = %key, "switch target not registered");
    }
}

/// Writes the payload into the session's `chat.returnMsg`, and hands the session over to the
/// next app when one is named by the message or the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendStep {
    pub server: String,
    /// Listener socket written to `chat.config.socket`.
    #[serde(default, alias = "nextListener", skip_serializing_if = "Option::is_none")]
    pub next_listener: Option<String>,
    #[serde(default, alias = "nextUri", skip_serializing_if = "Option::is_none")]
    pub next_uri: Option<String>,
    #[serde(default, alias = "nextAppName", skip_serializing_if = "Option::is_none")]
    pub next_app_name: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

#[typetag::serde(name = "message_send")]
#[async_trait]
impl StepType for MessageSendStep {
    fn type_name(&self) -> String {
        "message_send".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let session = msg
            .session_record()
            .ok_or_else(|| StepError::InvalidInput("message has neither record_path nor uid".into()))?;
        let next_app = target_key(
            msg.next_app_uri.as_ref(),
            msg.next_app_name.as_ref(),
            self.next_uri.as_ref(),
            self.next_app_name.as_ref(),
        )?;

        let client = ctx.client().await?;
        let delivery = Delivery {
            session,
            payload: msg.payload,
            socket: self.next_listener.clone(),
            next_app,
            strict: self.strict,
        };
        if let Some(outcome) = session::send_message(client.as_ref(), delivery).await? {
            report_outcome(ctx, &outcome);
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Moves the sender's session (`user/<uid>`) to another app: copies the registry entry into
/// `chat.config` and queues the app's greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSwitcherStep {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, alias = "appName", skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, alias = "nextListener", skip_serializing_if = "Option::is_none")]
    pub next_listener: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

#[typetag::serde(name = "app_switcher")]
#[async_trait]
impl StepType for AppSwitcherStep {
    fn type_name(&self) -> String {
        "app_switcher".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let uid = msg
            .uid_segment()
            .ok_or_else(|| StepError::InvalidInput("message has no uid".into()))?;
        let app_key = target_key(
            msg.app_uri.as_ref(),
            msg.app_name.as_ref(),
            self.uri.as_ref(),
            self.app_name.as_ref(),
        )?
        .ok_or_else(|| StepError::InvalidInput("no app to switch to".into()))?;

        let client = ctx.client().await?;
        let req = SwitchRequest {
            session: session_record_for(&uid),
            app_key,
            socket: self.next_listener.clone(),
            greet: true,
            strict: self.strict,
        };
        let outcome = session::switch_app(client.as_ref(), &req).await?;
        report_outcome(ctx, &outcome);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Publishes an app in `chat/apps` when the flow starts, and again after a reconnect if the
/// first attempt failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAppStep {
    pub server: String,
    #[serde(flatten)]
    pub app: AppEntry,
}

#[typetag::serde(name = "message_app")]
#[async_trait]
impl StepType for MessageAppStep {
    fn type_name(&self) -> String {
        "message_app".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn start(&self, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let entry = self.app.clone();
        ctx.start_or_retry(move |ctx| {
            let entry = entry.clone();
            async move {
                let client = ctx.client().await?;
                session::register_app(client.as_ref(), &entry).await?;
                Ok::<(), StepError>(())
            }
        })
        .await
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        ctx.warn("message_app takes no input, message ignored");
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn message_target_wins_over_config() {
        let key = target_key(s("u2").as_ref(), s("b").as_ref(), s("u1").as_ref(), s("a").as_ref()).unwrap();
        assert_eq!(key.as_deref(), Some("u2.b"));

        let key = target_key(None, None, s("u1").as_ref(), s("a").as_ref()).unwrap();
        assert_eq!(key.as_deref(), Some("u1.a"));

        assert_eq!(target_key(None, None, None, None).unwrap(), None);
    }

    #[test]
    fn half_a_target_is_rejected() {
        let err = target_key(s("u1").as_ref(), None, None, None).unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(_)));
    }

    #[test]
    fn message_app_reads_its_entry_inline() {
        let yaml = r#"
type: message_app
server: ds
name: app1
uri: u1
externalUrl: http://bot
message: hi
"#;
        let step: crate::step::Step = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(step.type_name(), "message_app");
        assert_eq!(step.server(), Some("ds"));
    }
}
