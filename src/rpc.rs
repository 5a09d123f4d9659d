//! Requester and provider halves of the RPC bridge.

use std::sync::Arc;
use std::time::Instant;

use ds_client::{DsClient, RpcError, RpcInvocation};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, event, info, Level};

use crate::connection::ServerLink;
use crate::error::StepError;
use crate::message::FlowMessage;

/// One RPC round trip, no retry. Every call leaves a `target: "request"` report line.
pub async fn invoke(client: &dyn DsClient, method: &str, payload: Value) -> Result<Value, RpcError> {
    let start = Instant::now();
    let result = client.rpc_make(method, payload).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
    match &result {
        Ok(_) => event!(
            target: "request",
            Level::INFO,
            method = %method,
            latency_ms = elapsed_ms,
            status = "ok",
            "rpc `{}` completed in {:.1} ms", method, elapsed_ms
        ),
        Err(e) => event!(
            target: "request",
            Level::ERROR,
            method = %method,
            latency_ms = elapsed_ms,
            status = "error",
            error = %e,
            "rpc `{}` failed after {:.1} ms", method, elapsed_ms
        ),
    }
    result
}

/// The method to call: the message topic when present, else the configured name.
pub fn method_for<'a>(msg: &'a FlowMessage, configured: &'a str) -> &'a str {
    msg.topic.as_deref().filter(|t| !t.is_empty()).unwrap_or(configured)
}

/// Turns an inbound invocation into a message whose payload is the ordered argument list and
/// which carries the response handle.
pub fn invocation_message(invocation: RpcInvocation) -> FlowMessage {
    debug!(method = %invocation.method, args = invocation.args.len(), "rpc invocation");
    FlowMessage::new(Value::Array(invocation.args)).with_response(invocation.response)
}

/// Provides `method` on the link, emitting one message per invocation. The registration is
/// renewed after every reconnect until `cancel` fires.
pub async fn provide<F>(link: Arc<ServerLink>, method: String, cancel: CancellationToken, mut emit: F)
where
    F: FnMut(FlowMessage) + Send,
{
    loop {
        let registered = link
            .open_with(&cancel, &method, |client| {
                let method = method.clone();
                async move { client.rpc_provide(&method).await }
            })
            .await;
        let Some(mut invocations) = registered else { return };
        info!(server = %link.config().id, %method, "providing rpc");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                inv = invocations.recv() => inv,
            };
            match next {
                Some(invocation) => emit(invocation_message(invocation)),
                None => break,
            }
        }
        debug!(%method, "provider registration ended, renewing");
    }
}

/// Completes the invocation a message answers: `err` fails it, otherwise a non-null payload
/// is sent. Exactly one terminal action reaches the handle.
pub fn resolve(msg: &FlowMessage) -> Result<(), StepError> {
    let res = msg.res.as_ref().ok_or(StepError::MissingHandle)?;
    if let Some(err) = &msg.err {
        res.error(err.clone())?;
        return Ok(());
    }
    if msg.payload.is_null() {
        return Err(StepError::EmptyResponse);
    }
    res.send(msg.payload.clone())?;
    Ok(())
}
