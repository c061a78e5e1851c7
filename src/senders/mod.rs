//! Senders write messages to a queue ([`Producer`]) or an exchange ([`Publisher`]).
//!
//! Both wait for the broker to confirm every message. If the connection is lost while
//! sending they reopen their channel (redialling if needed) and try exactly once more; a second
//! [`ErrorCode::LostConnection`](crate::error::ErrorCode::LostConnection) is returned to the
//! caller.
mod producer;
mod publisher;
mod sender;

pub use producer::Producer;
pub use publisher::{Publisher, ReturnCallback};

pub(crate) use sender::{encode, prepare_properties, Route, Sender};
