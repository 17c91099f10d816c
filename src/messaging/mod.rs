//! Outbound delivery and inbound reply handling.

pub mod dispatcher;
pub mod email;
pub mod inbound;
pub mod model;
pub mod retry;
pub mod sender;
pub mod twilio;

pub use dispatcher::{DispatchReport, MessageDispatcher, SendOutcome};
pub use inbound::{InboundEmail, InboundOutcome, InboundReplyHandler, InboundSms};
pub use model::{Channel, Direction, Message, MessageStatus, NewMessage};
pub use retry::RetryPolicy;
pub use sender::{EmailSender, OutboundEmail, OutboundSms, SmsSender};
