//! The error taxonomy surfaced to request listeners.

use std::time::Duration;

use thiserror::Error;

use crate::response::NetworkResponse;

/// Context attached to most [`Error`] variants: the last response snapshot
/// (when one was obtained) and the time the failing exchange took.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// The response the server sent, if a status line was received.
    pub response: Option<NetworkResponse>,
    /// Round-trip time of the failing attempt.
    pub network_time: Option<Duration>,
}

impl ErrorContext {
    pub(crate) fn with_response(response: NetworkResponse, network_time: Duration) -> Self {
        ErrorContext {
            response: Some(response),
            network_time: Some(network_time),
        }
    }

    pub(crate) fn elapsed(network_time: Duration) -> Self {
        ErrorContext {
            response: None,
            network_time: Some(network_time),
        }
    }
}

/// An error that prevented a request from producing a usable response.
///
/// Retryable variants ([`Timeout`](Self::Timeout),
/// [`AuthFailure`](Self::AuthFailure), [`Redirect`](Self::Redirect)) are fed
/// to the request's [`RetryPolicy`](crate::RetryPolicy) before they reach the
/// listener; the others are surfaced immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A socket or connect timeout.
    #[error("request timed out")]
    Timeout(ErrorContext),

    /// The transport produced neither a response nor a status code.
    #[error("no connection: {reason}")]
    NoConnection { reason: String },

    /// The server answered 401 or 403. Retryable so that a retry policy can
    /// be paired with credential refresh.
    #[error("authentication or authorization failure")]
    AuthFailure(ErrorContext),

    /// The server answered 301 or 302. Handled internally as a retry with
    /// the new URL; surfaced only when redirect retries are exhausted.
    #[error("too many redirects")]
    Redirect(ErrorContext),

    /// An unexpected status code, typically 5xx.
    #[error("server error")]
    Server(ErrorContext),

    /// An I/O error without a usable response body.
    #[error("network error")]
    Network(ErrorContext),

    /// The response was received but could not be parsed.
    #[error("malformed response: {0}")]
    Parse(String),
}

impl Error {
    /// Whether this error is eligible for the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::AuthFailure(_) | Error::Redirect(_)
        )
    }

    /// The response snapshot attached to this error, if any.
    pub fn response(&self) -> Option<&NetworkResponse> {
        self.context().and_then(|ctx| ctx.response.as_ref())
    }

    /// The network time of the failing attempt, if one was measured.
    pub fn network_time(&self) -> Option<Duration> {
        self.context().and_then(|ctx| ctx.network_time)
    }

    fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Timeout(ctx)
            | Error::AuthFailure(ctx)
            | Error::Redirect(ctx)
            | Error::Server(ctx)
            | Error::Network(ctx) => Some(ctx),
            Error::NoConnection { .. } | Error::Parse(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout(Default::default()).is_retryable());
        assert!(Error::AuthFailure(Default::default()).is_retryable());
        assert!(Error::Redirect(Default::default()).is_retryable());

        assert!(!Error::Server(Default::default()).is_retryable());
        assert!(!Error::Network(Default::default()).is_retryable());
        assert!(!Error::Parse("broken".into()).is_retryable());
        assert!(!Error::NoConnection {
            reason: "refused".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_response_snapshot() {
        let response = NetworkResponse {
            status: 503,
            ..Default::default()
        };
        let error = Error::Server(ErrorContext::with_response(
            response,
            Duration::from_millis(12),
        ));

        assert_eq!(error.response().map(|r| r.status), Some(503));
        assert_eq!(error.network_time(), Some(Duration::from_millis(12)));
    }
}
