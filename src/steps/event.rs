use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StepError;
use crate::events::{self, SessionListener};
use crate::message::FlowMessage;
use crate::step::{StepContext, StepType};

/// Emits the payload on the message topic (or the configured event) and passes the message on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEmitStep {
    pub server: String,
    #[serde(alias = "method")]
    pub event: String,
}

#[typetag::serde(name = "event_emit")]
#[async_trait]
impl StepType for EventEmitStep {
    fn type_name(&self) -> String {
        "event_emit".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let client = ctx.client().await?;
        let channel = msg.topic.as_deref().filter(|t| !t.is_empty()).unwrap_or(&self.event);
        client.event_emit(channel, msg.payload.clone()).await?;
        ctx.emit(msg);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Subscribes `channel` on the step's connection and hands every payload to `emit`.
async fn listen_on<F>(ctx: Arc<StepContext>, channel: String, emit: F) -> Result<(), StepError>
where
    F: FnMut(Value) + Send + 'static,
{
    let rx = ctx.link()?.subscribe_event(&channel).await?;
    debug!(step = %ctx.step_id(), %channel, "subscribed");
    ctx.spawn(events::forward(rx, ctx.cancel_token().clone(), emit));
    Ok(())
}

/// One `{payload}` message per event received on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubscribeStep {
    pub server: String,
    #[serde(alias = "method")]
    pub event: String,
}

#[typetag::serde(name = "event_subscribe")]
#[async_trait]
impl StepType for EventSubscribeStep {
    fn type_name(&self) -> String {
        "event_subscribe".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn start(&self, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let channel = self.event.clone();
        ctx.start_or_retry(move |ctx| {
            let emit = ctx.emitter();
            listen_on(ctx, channel.clone(), move |payload| emit(FlowMessage::new(payload)))
        })
        .await
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        ctx.warn("event_subscribe takes no input, message ignored");
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Messages addressed to an app on `<uri>/<app_name>/<method>`, tagged with the sender's uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceiveStep {
    pub server: String,
    pub uri: String,
    #[serde(alias = "appName")]
    pub app_name: String,
    pub method: String,
}

#[typetag::serde(name = "message_receive")]
#[async_trait]
impl StepType for MessageReceiveStep {
    fn type_name(&self) -> String {
        "message_receive".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn start(&self, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let channel = events::app_channel(&self.uri, &self.app_name, &self.method);
        ctx.start_or_retry(move |ctx| {
            let emit = ctx.emitter();
            listen_on(ctx, channel.clone(), move |payload| emit(events::app_message(payload)))
        })
        .await
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        ctx.warn("message_receive takes no input, message ignored");
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Follows `chat.messages` of every user announced on the control event; optionally stops
/// following users announced on `release_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageListenerStep {
    pub server: String,
    #[serde(alias = "method")]
    pub event: String,
    #[serde(default, alias = "release_channel", skip_serializing_if = "Option::is_none")]
    pub release_event: Option<String>,
}

#[typetag::serde(name = "message_listener")]
#[async_trait]
impl StepType for MessageListenerStep {
    fn type_name(&self) -> String {
        "message_listener".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn start(&self, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let listener = SessionListener::new(ctx.link()?.clone(), ctx.cancel_token().child_token());
        let closing = listener.clone();
        let closed = ctx.cancel_token().clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            closing.shutdown();
        });

        let control = self.event.clone();
        let sessions = listener.clone();
        let started = ctx
            .start_or_retry(move |ctx| {
                let sessions = sessions.clone();
                let emit = Arc::new(ctx.emitter());
                listen_on(ctx, control.clone(), move |announced| {
                    let Some(uid) = events::announced_uid(&announced) else {
                        debug!("ignoring announcement without a usable uid");
                        return;
                    };
                    let emit = emit.clone();
                    sessions.listen(&uid, move |msg| (*emit)(msg));
                })
            })
            .await;

        if let Some(release) = &self.release_event {
            let release = release.clone();
            let sessions = listener.clone();
            ctx.start_or_retry(move |ctx| {
                let sessions = sessions.clone();
                listen_on(ctx, release.clone(), move |announced| {
                    if let Some(uid) = events::announced_uid(&announced) {
                        sessions.release(&uid);
                    }
                })
            })
            .await?;
        }
        started
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        ctx.warn("message_listener takes no input, message ignored");
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}
