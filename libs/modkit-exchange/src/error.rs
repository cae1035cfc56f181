use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a connector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection could not be established (refused, DNS, TLS handshake)
    Connect,
    /// Request or body read timed out
    Timeout,
    /// Failure while streaming a request or response body
    Body,
    /// Anything the connector could not classify
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error produced by the default status mapping of `retrieve()`.
///
/// Carries everything needed to diagnose the failed call, including the
/// fully buffered response body.
#[derive(Debug, Clone)]
pub struct ResponseStatusError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub method: Method,
    pub url: Option<Url>,
}

impl ResponseStatusError {
    /// Body as lossy UTF-8, for diagnostics.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Display for ResponseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.status, self.method)?;
        if let Some(url) = &self.url {
            write!(f, " {url}")?;
        }
        Ok(())
    }
}

/// Errors returned by exchange client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("URI resolution error: {0}")]
    UriResolution(String),

    #[error("Request build error: {0}")]
    Build(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("HTTP error: {0}")]
    ResponseStatus(Box<ResponseStatusError>),

    #[error("Transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Exchange cancelled")]
    Cancelled,
}

impl ClientError {
    #[must_use]
    pub fn transport(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        ClientError::Transport {
            kind,
            source: source.into(),
        }
    }

    pub(crate) fn body_consumed() -> Self {
        ClientError::IllegalState("response body already consumed or released".into())
    }

    /// Status of a `ResponseStatus` error, if this is one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::ResponseStatus(e) => Some(e.status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            }
        )
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decoding(err.to_string())
    }
}

impl From<ResponseStatusError> for ClientError {
    fn from(err: ResponseStatusError) -> Self {
        ClientError::ResponseStatus(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accessor() {
        let err = ClientError::from(ResponseStatusError {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"missing"),
            method: Method::GET,
            url: Url::parse("http://x/persons/7").ok(),
        });
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(
            err.to_string(),
            "HTTP error: 404 Not Found from GET http://x/persons/7"
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn test_transport_timeout() {
        let err = ClientError::transport(
            TransportErrorKind::Timeout,
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline"),
        );
        assert!(err.is_timeout());
        assert!(err.is_transport());
        assert_eq!(err.status(), None);
    }
}
