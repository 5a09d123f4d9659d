use ds_client::{ClientError, RpcError};
use thiserror::Error;

/// Failures acquiring a ready connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Opening the transport failed. The reconnect loop keeps retrying.
    #[error("transport error on {server}: {reason}")]
    Transport { server: String, reason: String },
    /// The backend rejected the credentials. Not retried until the next acquisition.
    #[error("login failed on {server}: {reason}")]
    Login { server: String, reason: String },
    /// The manager or the connection was shut down.
    #[error("connection {0} is closed")]
    Closed(String),
}

/// Failures of a single step operation. Reported through the step's reporter, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Client(#[from] ClientError),
    /// A response message arrived without the handle of the invocation it answers.
    #[error("message has no RPC response handle")]
    MissingHandle,
    /// A response message carried neither a payload nor an `err`.
    #[error("message has neither a payload nor an error to respond with")]
    EmptyResponse,
    /// The app-switch target is not in the registry (strict mode only).
    #[error("no app registered at {0}")]
    LookupMiss(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
