use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the client wrappers.
///
/// The enum is `Clone` because a single batch failure is delivered to every
/// caller that took part in the batch; foreign error types are kept behind an
/// `Arc` so the original source stays reachable.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("batcher is closed")]
    Closed,

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("task dropped before it was resolved")]
    Abandoned,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("missing response for request id {0}")]
    MissingResponse(u64),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("redis error: {0}")]
    Redis(#[source] Arc<redis::RedisError>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the caller gave up waiting, as opposed to the backend failing.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
