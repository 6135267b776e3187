//! Failure taxonomy for job handlers.
//!
//! Handlers return [`HandlerError`]; the worker pool asks
//! [`HandlerError::is_retryable`] whether another attempt is worth making.
//! Handlers that work with arbitrary errors can bubble them through
//! [`HandlerError::classify`], which looks for well-known transient signals.

use std::future::Future;
use std::io;
use std::time::Duration;

/// Error raised by a job handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("no handler registered for job type `{0}`")]
    UnknownJobType(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(anyhow::Error),
}

impl HandlerError {
    /// Transient failures are retried; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Timeout(_)
            | HandlerError::ConnectionReset(_)
            | HandlerError::RateLimited(_)
            | HandlerError::Unavailable(_) => true,
            HandlerError::Upstream { status, .. } => is_retryable_status(*status),
            HandlerError::Validation(_)
            | HandlerError::Unauthorized(_)
            | HandlerError::MalformedInput(_)
            | HandlerError::UnknownJobType(_)
            | HandlerError::Panicked(_)
            | HandlerError::Other(_) => false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        HandlerError::Timeout(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Validation(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        HandlerError::MalformedInput(message.into())
    }

    /// Map an arbitrary error onto the taxonomy.
    ///
    /// Checks, in order: an embedded `HandlerError`, I/O error kinds anywhere
    /// in the chain, tokio timeouts, then the rendered message. Unrecognised
    /// errors become [`HandlerError::Other`] and are not retried.
    pub fn classify(err: anyhow::Error) -> Self {
        let err = match err.downcast::<HandlerError>() {
            Ok(handler_err) => return handler_err,
            Err(err) => err,
        };

        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                match io_err.kind() {
                    io::ErrorKind::TimedOut => {
                        return HandlerError::Timeout(io_err.to_string());
                    }
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe => {
                        return HandlerError::ConnectionReset(io_err.to_string());
                    }
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected => {
                        return HandlerError::Unavailable(io_err.to_string());
                    }
                    io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                        return HandlerError::MalformedInput(io_err.to_string());
                    }
                    _ => {}
                }
            }
            if cause.is::<tokio::time::error::Elapsed>() {
                return HandlerError::Timeout(cause.to_string());
            }
            if cause.is::<serde_json::Error>() {
                return HandlerError::MalformedInput(cause.to_string());
            }
        }

        let message = format!("{err:#}");
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("timed out") || lowered.contains("timeout") {
            HandlerError::Timeout(message)
        } else if lowered.contains("econnreset") || lowered.contains("connection reset") {
            HandlerError::ConnectionReset(message)
        } else if lowered.contains("429") || lowered.contains("rate limit") {
            HandlerError::RateLimited(message)
        } else if lowered.contains("503")
            || lowered.contains("502")
            || lowered.contains("504")
            || lowered.contains("unavailable")
        {
            HandlerError::Unavailable(message)
        } else if lowered.contains("401")
            || lowered.contains("403")
            || lowered.contains("unauthorized")
            || lowered.contains("forbidden")
        {
            HandlerError::Unauthorized(message)
        } else {
            HandlerError::Other(err)
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::classify(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::MalformedInput(err.to_string())
    }
}

/// 5xx and 429 are worth retrying; other statuses are the caller's fault.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status == 408 || (500..=599).contains(&status)
}

/// Bound a single handler step, mapping expiry to [`HandlerError::Timeout`].
pub async fn with_timeout<F, T>(
    limit: Duration,
    step: &str,
    future: F,
) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Timeout(format!(
            "{step} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}
