use thiserror::Error;

/// Error kinds shared across the workspace. The kind decides propagation:
/// `InvalidArgument`/`Forbidden` surface before a stream starts and are never
/// retried, `NotFound` is terminal for a single endpoint, `Transient` is
/// retried with bounded backoff, `Fatal` terminates the stream, `Cancelled`
/// is silent.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error must take the whole stream down, as opposed to a
    /// single endpoint.
    pub fn is_stream_terminal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Forbidden(_))
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Fatal(e.to_string())
    }
}
