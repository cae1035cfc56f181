use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;

use super::{Connector, ConnectorRequest, ConnectorResponse};
use crate::body::Body;
use crate::error::{ClientError, TransportErrorKind};

/// Default connector backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    http_client: reqwest::Client,
}

impl ReqwestConnector {
    /// Connector with reqwest defaults
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, ClientError> {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> ReqwestConnectorBuilder {
        ReqwestConnectorBuilder::default()
    }

    /// Wrap an already configured client
    #[must_use]
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

fn classify(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    ClientError::transport(classify(&err), err)
}

#[async_trait]
impl Connector for ReqwestConnector {
    async fn connect(&self, request: ConnectorRequest) -> Result<ConnectorResponse, ClientError> {
        let ConnectorRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut req_builder = self.http_client.request(method, url).headers(headers);

        if let Some(timeout) = timeout {
            req_builder = req_builder.timeout(timeout);
        }

        req_builder = match body {
            Body::Empty => req_builder,
            Body::Bytes(bytes) => req_builder.body(bytes),
            Body::Stream(stream) => req_builder.body(reqwest::Body::wrap_stream(stream)),
        };

        let resp = req_builder.send().await.map_err(transport_error)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let stream = resp.bytes_stream().map_err(transport_error);

        Ok(ConnectorResponse {
            status,
            headers,
            body: Box::pin(stream),
        })
    }
}

/// Builder for [`ReqwestConnector`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestConnectorBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl ReqwestConnectorBuilder {
    /// Total timeout applied to each request without its own timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the connector
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if reqwest rejects the configuration.
    pub fn build(self) -> Result<ReqwestConnector, ClientError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(user_agent) = self.user_agent {
            builder = builder.user_agent(user_agent);
        }

        let http_client = builder
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;
        Ok(ReqwestConnector { http_client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let connector = ReqwestConnector::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let request = ConnectorRequest {
            method: Method::GET,
            url: "http://127.0.0.1:1/".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            timeout: None,
        };

        let err = connector.connect(request).await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }
}
