use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::message::{ClientError, ClientOptions, ConnectionState, Credentials, RpcError};
use crate::path;

/// Stream of values pushed by the server for one event channel or record path.
///
/// Dropping the receiver unsubscribes; the server prunes closed senders on its next delivery.
pub type Subscription = mpsc::UnboundedReceiver<Value>;

/// The capabilities the bridge needs from a records / events / RPC backend.
///
/// Every call completes asynchronously; none of them block the runtime.
#[async_trait]
pub trait DsClient: Send + Sync + fmt::Debug {
    fn connection_state(&self) -> ConnectionState;

    async fn login(&self, credentials: &Credentials) -> Result<(), ClientError>;

    /// Receives every transport-level error raised after the client was created.
    fn transport_errors(&self) -> broadcast::Receiver<ClientError>;

    async fn close(&self);

    /// Waits until the record is ready and returns the whole document.
    async fn record_snapshot(&self, name: &str) -> Result<Value, ClientError>;

    /// Reads the record (or one of its paths) once it is ready. Missing paths read as `null`.
    async fn record_get(&self, name: &str, path: Option<&str>) -> Result<Value, ClientError> {
        let doc = self.record_snapshot(name).await?;
        Ok(match path {
            Some(p) => path::get(&doc, p).cloned().unwrap_or(Value::Null),
            None => doc,
        })
    }

    async fn record_set(&self, name: &str, path: Option<&str>, value: Value) -> Result<(), ClientError>;

    async fn record_subscribe(&self, name: &str, path: Option<&str>) -> Result<Subscription, ClientError>;

    async fn event_emit(&self, channel: &str, data: Value) -> Result<(), ClientError>;

    async fn event_subscribe(&self, channel: &str) -> Result<Subscription, ClientError>;

    /// One RPC round trip, bounded by the ack and response timeouts the client was created with.
    async fn rpc_make(&self, method: &str, data: Value) -> Result<Value, RpcError>;

    /// Registers this client as a provider for `method`; every invocation arrives on the receiver.
    async fn rpc_provide(&self, method: &str) -> Result<mpsc::UnboundedReceiver<RpcInvocation>, ClientError>;
}

/// Opens transport connections. One call yields one fresh, unauthenticated client.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, url: &str, options: ClientOptions) -> Result<Arc<dyn DsClient>, ClientError>;
}

/// An inbound call for a method this client provides.
#[derive(Debug)]
pub struct RpcInvocation {
    pub method: String,
    /// Positional arguments, excluding the response handle.
    pub args: Vec<Value>,
    pub response: RpcResponse,
}

type ResponseSender = oneshot::Sender<Result<Value, String>>;

/// Single-use handle answering one [`RpcInvocation`].
///
/// Clones share the same underlying slot, so whichever clone resolves first wins and every
/// later attempt gets [`ClientError::ResponseAlreadySent`].
#[derive(Clone)]
pub struct RpcResponse {
    method: String,
    slot: Arc<Mutex<Option<ResponseSender>>>,
}

impl RpcResponse {
    pub fn new(method: impl Into<String>) -> (Self, oneshot::Receiver<Result<Value, String>>) {
        let (tx, rx) = oneshot::channel();
        let me = Self {
            method: method.into(),
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (me, rx)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn send(&self, value: Value) -> Result<(), ClientError> {
        self.resolve(Ok(value))
    }

    pub fn error(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.resolve(Err(reason.into()))
    }

    pub fn is_resolved(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    fn resolve(&self, outcome: Result<Value, String>) -> Result<(), ClientError> {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let sender = sender.ok_or(ClientError::ResponseAlreadySent)?;
        if sender.send(outcome).is_err() {
            debug!(method = %self.method, "requester went away before the response arrived");
        }
        Ok(())
    }
}

impl fmt::Debug for RpcResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcResponse")
            .field("method", &self.method)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
