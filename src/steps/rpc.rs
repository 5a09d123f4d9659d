use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::message::FlowMessage;
use crate::rpc;
use crate::status::{Fill, NodeStatus, Shape};
use crate::step::{StepContext, StepType};

/// Calls `method` (or the message topic) with the payload and forwards the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMakeStep {
    pub server: String,
    pub method: String,
}

#[typetag::serde(name = "rpc_make")]
#[async_trait]
impl StepType for RpcMakeStep {
    fn type_name(&self) -> String {
        "rpc_make".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn process(&self, mut msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let client = ctx.client().await?;
        let method = rpc::method_for(&msg, &self.method).to_string();
        let payload = std::mem::take(&mut msg.payload);
        msg.payload = rpc::invoke(client.as_ref(), &method, payload).await?;
        ctx.emit(msg);
        Ok(())
    }

    // calls wait on remote providers
    fn concurrent(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Answers calls to `method`: one message per invocation, carrying the arguments as payload
/// and the response handle as `res`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcProvideStep {
    pub server: String,
    pub method: String,
}

#[typetag::serde(name = "rpc_provide")]
#[async_trait]
impl StepType for RpcProvideStep {
    fn type_name(&self) -> String {
        "rpc_provide".to_string()
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }

    async fn start(&self, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let link = ctx.link()?.clone();
        let emit = ctx.emitter();
        ctx.spawn(rpc::provide(link, self.method.clone(), ctx.cancel_token().clone(), emit));
        Ok(())
    }

    async fn process(&self, _msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        ctx.warn("rpc_provide takes no input, message ignored");
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}

/// Resolves the invocation a message carries: `err` fails it, the payload answers it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponseStep {}

#[typetag::serde(name = "rpc_response")]
#[async_trait]
impl StepType for RpcResponseStep {
    fn type_name(&self) -> String {
        "rpc_response".to_string()
    }

    fn server(&self) -> Option<&str> {
        None
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError> {
        let resolved = rpc::resolve(&msg);
        if let Err(StepError::MissingHandle) = &resolved {
            ctx.status(NodeStatus::new(Fill::Red, Shape::Dot, "no response in msg"));
        }
        resolved
    }

    fn clone_box(&self) -> Box<dyn StepType> {
        Box::new(self.clone())
    }
}
