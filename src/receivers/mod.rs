//! Receivers pull messages from a queue, one at a time, with manual acknowledgements.
//!
//! A [`Consumer`] reads a configured queue. A [`Subscriber`] reads the queue it binds to an
//! exchange, either temporary or durable.
mod consumer;
mod received;
mod receiver;
mod subscriber;

pub use consumer::Consumer;
pub use received::Received;
pub use subscriber::Subscriber;

pub(crate) use receiver::Receiver;

/// What `receive` does when the window elapses without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoMessageMode {
    /// Fail with [`Error::Timeout`](crate::Error::Timeout).
    #[default]
    Timeout,
    /// Return `Ok(None)`.
    ReturnNone,
}
