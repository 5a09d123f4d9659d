use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::events;
use crate::message::FlowMessage;
use crate::step::{StepContext, StepType};

/// Emits `{payload: <record>}` (or the value at `path`) for every inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordGetStep {
    pub server: String,
    #[serde(alias = "recordPath")]
    pub record: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[typetag::serde(name = "record_get")]
#[async_trait]
impl StepType for RecordGetStep {
    fn type_name(&self) -> String {
        "record_get".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let client = ctx.client().await?;
        let value = client.record_get(&self.record, self.path.as_deref()).await?;
        ctx.emit(FlowMessage::new(value));
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Writes the payload into the record, whole or at `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUpdateStep {
    pub server: String,
    #[serde(alias = "recordPath")]
    pub record: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[typetag::serde(name = "record_update")]
#[async_trait]
impl StepType for RecordUpdateStep {
    fn type_name(&self) -> String {
        "record_update".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let client = ctx.client().await?;
        client.record_set(&self.record, self.path.as_deref(), msg.payload).await?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// On input, emits the current record as `{topic: "record"}`, then `{topic: "update"}` for
/// every later change of the record or of `path`. Repeated inputs re-read the record but
/// keep a single subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSubscribeStep {
    pub server: String,
    #[serde(alias = "recordPath")]
    pub record: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[typetag::serde(name = "record_subscribe")]
#[async_trait]
impl StepType for RecordSubscribeStep {
    fn type_name(&self) -> String {
        "record_subscribe".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let client = ctx.client().await?;
        let current = client.record_snapshot(&self.record).await?;
        ctx.emit(FlowMessage::new(current).with_topic("record"));

        if ctx.first_time("subscription") {
            let emit = ctx.emitter();
            ctx.spawn(events::follow_record(
                ctx.link()?.clone(),
                self.record.clone(),
                self.path.clone(),
                ctx.cancel_token().clone(),
                move |value| emit(FlowMessage::new(value).with_topic("update")),
            ));
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}
