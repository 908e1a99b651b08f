//! Execution client boundary.
//!
//! The engine never talks to a metrics store directly. It hands compiled
//! query text to a [`QueryClient`], which owns transport, authentication and
//! retries.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::ClientResponse;

/// Errors reported by an execution client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The store could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store rejected the query.
    #[error("status {code}: {message}")]
    Status {
        /// HTTP-style status code.
        code: u16,
        /// Message returned by the store.
        message: String,
    },

    /// The query did not finish within its timeout.
    #[error("query timed out")]
    Timeout,

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Async execution client for the metrics store.
///
/// Implementations must be cheap to share across tasks; the executor keeps one
/// behind an `Arc` and calls it from concurrent batch units.
pub trait QueryClient: Send + Sync + 'static {
    /// Evaluates `query` at a single instant. The result is a Vector.
    fn query(
        &self,
        query: &str,
        time: DateTime<Utc>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ClientResponse, ClientError>> + Send;

    /// Evaluates `query` over `[start, end]` every `step`. The result is a Matrix.
    fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ClientResponse, ClientError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "query timed out");
        assert_eq!(
            ClientError::Status {
                code: 400,
                message: "bad_data".to_string(),
            }
            .to_string(),
            "status 400: bad_data"
        );
        assert_eq!(
            ClientError::Transport("connection refused".to_string()).to_string(),
            "transport error: connection refused"
        );
    }
}
