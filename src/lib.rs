pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod flow;
pub mod logger;
pub mod message;
pub mod rpc;
pub mod session;
pub mod status;
pub mod step;
pub mod steps;
