//! The error taxonomy shared by every sender, receiver and pool.
//!
//! Transport failures are translated exactly once, at the point of the underlying I/O call,
//! into either a typed [`MessageError`] (carrying an [`ErrorCode`]) or passed through unchanged
//! as [`Error::Transport`].
use std::fmt;
use std::time::Duration;

/// The closed set of failure classes a caller can act upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The connection or the channel is no longer usable.
    ///
    /// Retryable: the next call re-opens the channel (and redials the connection if needed).
    LostConnection,
    /// A competing exclusive consumer or an exclusive queue owned by another connection
    /// prevents access.
    ///
    /// Retryable by the caller after a backoff.
    ExclusiveLock,
    /// A message cannot be processed (e.g. its payload cannot be decoded).
    ///
    /// It should be rejected or dead-lettered rather than retried.
    PoisonMessage,
    /// Every configured endpoint failed during a connection attempt.
    ///
    /// The source of the [`MessageError`] is an [`AggregateError`] listing every failure.
    NoAcceptableEndpoints,
    /// Configuration or programming errors, e.g. a missing setting or an undeclared destination.
    UnhandledError,
}

impl ErrorCode {
    /// Returns `true` if retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LostConnection | Self::ExclusiveLock | Self::NoAcceptableEndpoints
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LostConnection => write!(f, "lost connection"),
            Self::ExclusiveLock => write!(f, "exclusive lock"),
            Self::PoisonMessage => write!(f, "poison message"),
            Self::NoAcceptableEndpoints => write!(f, "no acceptable endpoints"),
            Self::UnhandledError => write!(f, "unhandled"),
        }
    }
}

/// A transport failure classified into an [`ErrorCode`].
#[derive(thiserror::Error, Debug)]
#[error("Messaging operation failed with a {code} error: {source:#}")]
pub struct MessageError {
    code: ErrorCode,
    #[source]
    source: anyhow::Error,
}

impl MessageError {
    pub fn new(code: ErrorCode, source: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            source: source.into(),
        }
    }

    /// Shorthand for configuration and programming errors.
    pub(crate) fn unhandled(message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnhandledError, anyhow::anyhow!("{message}"))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The per-endpoint failures behind a [`ErrorCode::NoAcceptableEndpoints`] error.
    pub fn aggregate(&self) -> Option<&AggregateError> {
        self.source.downcast_ref::<AggregateError>()
    }

    pub fn into_source(self) -> anyhow::Error {
        self.source
    }
}

/// The failure of one endpoint during a connection attempt.
#[derive(Debug)]
pub struct EndpointFailure {
    /// The endpoint that was dialled, e.g. `amqp://rmq-1:5672`.
    pub endpoint: String,
    pub error: anyhow::Error,
}

/// Every failure captured while cycling through the endpoints of a connection.
#[derive(thiserror::Error, Debug)]
pub struct AggregateError {
    failures: Vec<EndpointFailure>,
}

impl AggregateError {
    pub(crate) fn new(failures: Vec<EndpointFailure>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[EndpointFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} endpoint(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {:#}", failure.endpoint, failure.error)?;
        }
        Ok(())
    }
}

/// The error returned by senders, receivers and received messages.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A classified failure - check [`MessageError::code`] to decide what to do next.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// No message arrived within the receive window.
    ///
    /// This is an expected signal when polling, not a failure.
    #[error("No message was received within {0:?}")]
    Timeout(Duration),
    /// The shutdown signal resolved before the operation completed.
    #[error("The operation was cancelled by a shutdown signal")]
    Cancelled,
    /// The transport does not offer this capability.
    #[error("`{0}` is not supported by this transport")]
    NotSupported(&'static str),
    /// A transport error that could not be classified.
    ///
    /// It should terminate the operation rather than be retried blindly.
    #[error("Unrecognised transport error")]
    Transport(#[source] anyhow::Error),
}

impl Error {
    /// The [`ErrorCode`] of a classified failure, `None` otherwise.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Message(e) => Some(e.code()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_lost_connection(&self) -> bool {
        self.code() == Some(ErrorCode::LostConnection)
    }
}
