//! Shared backend connections.
//!
//! One [`ServerLink`] exists per server configuration id. Steps take a [`Lease`] on it, acquire
//! the live client per operation, and release the lease on shutdown; the connection closes
//! when the last lease goes. Transport failures put the link through a fixed-delay reconnect
//! loop that never gives up.

mod dispatcher;
mod manager;
mod state;

pub use dispatcher::EventDispatcher;
pub use manager::{ConnectionManager, Lease, ServerLink};
pub use state::LinkState;
