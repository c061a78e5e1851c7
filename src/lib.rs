//! `warren` sends and receives RabbitMQ messages through connections that survive broker
//! restarts and failovers.
//!
//! Connections are named and configured once, with a comma separated list of endpoints. The
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) dials them in turn, caches the
//! connection that succeeded and redials when it dies. Senders and receivers open their own
//! channel on the shared connection and reopen it (and redeclare their queue or exchange) after a
//! failure:
//!
//! - [`Producer`](crate::senders::Producer) sends to a queue,
//!   [`Publisher`](crate::senders::Publisher) to an exchange;
//! - [`Consumer`](crate::receivers::Consumer) receives from a queue,
//!   [`Subscriber`](crate::receivers::Subscriber) from an exchange, through a temporary or a
//!   durable subscription queue;
//! - [`Pool`](crate::pool::Pool) keeps any of the above warm for reuse.
//!
//! Failures surface as [`Error`], whose [`ErrorCode`] tells callers whether retrying makes sense.
//!
//! The broker sits behind the [`Transport`](crate::transport::Transport) trait:
//! [`RabbitMq`](crate::transport::RabbitMq) talks AMQP 0.9.1 through [`lapin`]. The
//! `test-util` feature adds `MemoryBroker`, an in-process broker for tests.
pub mod configuration;
pub mod error;
pub mod message;
pub mod named_lock;
pub mod pool;
pub mod receivers;
pub mod registry;
pub mod senders;
pub mod transport;

mod link;
mod topology;

pub use error::{AggregateError, EndpointFailure, Error, ErrorCode, MessageError};
