use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Lifecycle of the shared connection to one server.
///
/// `Idle → Connecting → Authenticating → Open`; after a transport error
/// `Open → Closing → Backoff → Connecting`. A rejected login parks the link in `LoginFailed`
/// until the next acquisition retries it. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Connecting,
    Authenticating,
    Open,
    Closing,
    Backoff,
    LoginFailed,
    Closed,
}

impl LinkState {
    /// Tearing down or waiting to reconnect. Acquirers wait these out instead of connecting.
    pub fn is_recovering(self) -> bool {
        matches!(self, LinkState::Closing | LinkState::Backoff)
    }
}
