use thiserror::Error;

#[derive(Debug, Error)]
pub enum LbPoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A connection was requested from a pool that was never started (or was
    /// closed while the request was in flight).
    #[error("'{0}' connection cannot be opened because the server pool has not been started")]
    NotStarted(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

#[cfg(feature = "metrics")]
impl From<prometheus::Error> for LbPoolError {
    fn from(err: prometheus::Error) -> Self {
        LbPoolError::Metrics(err.to_string())
    }
}

impl From<rustls::Error> for LbPoolError {
    fn from(err: rustls::Error) -> Self {
        LbPoolError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LbPoolError>;
