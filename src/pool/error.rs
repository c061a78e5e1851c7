use crate::error::Error;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// Creating (and opening) a new instance failed.
    #[error(transparent)]
    Messaging(#[from] Error),
    /// Every instance is leased and the pool is at its maximum size.
    #[error("No pooled instance became available in time")]
    Exhausted,
    #[error("The pool is closed")]
    Closed,
    #[error(transparent)]
    Other(anyhow::Error),
}

impl PoolError {
    /// The error code of a failed creation, if it was classified.
    pub fn code(&self) -> Option<crate::error::ErrorCode> {
        match self {
            Self::Messaging(e) => e.code(),
            _ => None,
        }
    }
}

impl From<deadpool::managed::PoolError<Error>> for PoolError {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => Self::Messaging(e),
            deadpool::managed::PoolError::Timeout(_) => Self::Exhausted,
            deadpool::managed::PoolError::Closed => Self::Closed,
            err => Self::Other(anyhow::anyhow!("{err}")),
        }
    }
}
