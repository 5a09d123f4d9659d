pub mod client;
pub mod memory;
pub mod message;
pub mod path;

pub use client::{Connector, DsClient, RpcInvocation, RpcResponse, Subscription};
pub use memory::MemoryServer;
pub use message::{ClientError, ClientOptions, ConnectionState, Credentials, RpcError};
