use std::time::Duration;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Transport-level connection state as reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Error,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(alias = "user")]
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Options handed to the transport when a client is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub subscription_timeout: Duration,
    pub rpc_ack_timeout: Duration,
    pub rpc_response_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            subscription_timeout: Duration::from_millis(500),
            rpc_ack_timeout: Duration::from_millis(6000),
            rpc_response_timeout: Duration::from_millis(10000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("login rejected: {0}")]
    Login(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("client is closed")]
    Closed,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("response already sent")]
    ResponseAlreadySent,
    #[error("{0}")]
    Other(String),
}

/// Failure of a single RPC round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("NO_RPC_PROVIDER")]
    NoProvider,
    #[error("ACK_TIMEOUT")]
    AckTimeout,
    #[error("RESPONSE_TIMEOUT")]
    ResponseTimeout,
    /// The provider answered with `error(...)`.
    #[error("{0}")]
    Provider(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "OPEN");
        assert_eq!(ConnectionState::AwaitingAuthentication.as_ref(), "AWAITING_AUTHENTICATION");
        let parsed: ConnectionState = "CLOSED".parse().unwrap();
        assert_eq!(parsed, ConnectionState::Closed);
    }

    #[test]
    fn credentials_accept_user_alias_and_hide_password() {
        let creds: Credentials = serde_json::from_str(r#"{"user":"bob","password":"pw"}"#).unwrap();
        assert_eq!(creds.username, "bob");
        assert!(!format!("{:?}", creds).contains("pw\""));
    }

    #[test]
    fn rpc_error_display_matches_backend_codes() {
        assert_eq!(RpcError::NoProvider.to_string(), "NO_RPC_PROVIDER");
        assert_eq!(RpcError::Provider("bad".into()).to_string(), "bad");
    }
}
