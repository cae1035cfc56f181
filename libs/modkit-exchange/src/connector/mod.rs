//! The transport seam: one HTTP exchange at the wire level.
//!
//! A [`Connector`] receives a fully encoded request and returns status,
//! headers and a lazily read body stream. Everything above it (codecs,
//! filters, status handling) is transport-agnostic.

mod reqwest_connector;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::body::{Body, ByteStream};
use crate::error::ClientError;

pub use reqwest_connector::{ReqwestConnector, ReqwestConnectorBuilder};

/// Encoded request handed to a connector
#[derive(Debug)]
pub struct ConnectorRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    /// Per-request timeout overriding the connector default
    pub timeout: Option<Duration>,
}

/// Wire-level response; the body is read on demand.
pub struct ConnectorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl fmt::Debug for ConnectorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP exchanges on behalf of the client.
///
/// Implementations must release the underlying connection when the response
/// body stream is dropped, whether or not it was read to the end.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send `request` and return once the response head is available.
    ///
    /// # Errors
    /// Returns [`ClientError::Transport`] for connect, timeout and I/O failures.
    async fn connect(&self, request: ConnectorRequest) -> Result<ConnectorResponse, ClientError>;
}
