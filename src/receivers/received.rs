use crate::error::{Error, ErrorCode, MessageError};
use crate::message::{FromHeaderValue, HeaderValue, Headers, Payload};
use crate::transport::Acknowledge;
use std::fmt;
use std::sync::Arc;

pub(crate) type Classifier = Arc<dyn Fn(&anyhow::Error) -> Option<ErrorCode> + Send + Sync>;

/// A message taken off a queue, waiting to be acknowledged or rejected.
///
/// Dropping it without settling leaves the message unacknowledged: the broker delivers it
/// again once the receiver's channel closes.
pub struct Received<P: Payload> {
    /// The decoded payload.
    pub data: P::Owned,
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) redelivered: bool,
    pub(crate) headers: Headers,
    pub(crate) settled: bool,
    pub(crate) acker: Box<dyn Acknowledge>,
    pub(crate) classify: Classifier,
}

impl<P: Payload> fmt::Debug for Received<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("message_id", &self.message_id)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl<P: Payload> Received<P> {
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The exchange the message was published to, empty for the default exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the message was delivered before and not acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Typed lookup of a header. `None` if it is missing or of another type.
    pub fn get_header<T: FromHeaderValue>(&self, key: &str) -> Option<T> {
        self.headers.get(key).and_then(T::from_header_value)
    }

    /// Typed lookup of a header, falling back to `default`.
    pub fn get_header_or<T: FromHeaderValue>(&self, key: &str, default: T) -> T {
        self.get_header(key).unwrap_or(default)
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Whether the message was acknowledged or rejected already.
    pub fn is_acknowledged(&self) -> bool {
        self.settled
    }

    /// Tell the broker the message was processed. Calling it again does nothing.
    pub async fn acknowledge(&mut self) -> Result<(), Error> {
        if self.settled {
            return Ok(());
        }
        match self.acker.ack().await {
            Ok(()) => {
                self.settled = true;
                Ok(())
            }
            Err(e) => Err(self.translate(e)),
        }
    }

    /// Hand the message back to the broker, which redelivers it if `requeue` is set and
    /// dead-letters (or drops) it otherwise.
    ///
    /// Does nothing if the message was settled already. Fails with [`Error::NotSupported`]
    /// on transports without negative acknowledgements.
    pub async fn reject(&mut self, requeue: bool) -> Result<(), Error> {
        if self.settled {
            return Ok(());
        }
        if !self.acker.can_reject() {
            return Err(Error::NotSupported("reject"));
        }
        match self.acker.reject(requeue).await {
            Ok(()) => {
                self.settled = true;
                Ok(())
            }
            Err(e) => Err(self.translate(e)),
        }
    }

    fn translate(&self, error: anyhow::Error) -> Error {
        match (self.classify)(&error) {
            Some(code) => MessageError::new(code, error).into(),
            None => Error::Transport(error),
        }
    }
}
