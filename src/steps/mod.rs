//! The concrete step types a flow file can name, by their `type` tag.

pub mod chat;
pub mod event;
pub mod record;
pub mod rpc;

pub use chat::{AppSwitcherStep, MessageAppStep, MessageSendStep};
pub use event::{EventEmitStep, EventSubscribeStep, MessageListenerStep, MessageReceiveStep};
pub use record::{RecordGetStep, RecordSubscribeStep, RecordUpdateStep};
pub use rpc::{RpcMakeStep, RpcProvideStep, RpcResponseStep};
