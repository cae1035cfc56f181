#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use modkit_exchange::connector::{ConnectorRequest, ConnectorResponse};
use modkit_exchange::{ClientError, Connector, ExchangeClient};
use parking_lot::Mutex;
use url::Url;

/// Request as seen by the stub, with the body fully read.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Canned response produced by a stub handler.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            delay: None,
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::status(status)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers
            .append(name, HeaderValue::from_str(value).unwrap());
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.chunks = vec![Bytes::copy_from_slice(body.as_bytes())];
        self
    }

    /// Body delivered as separate chunks
    pub fn chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks
            .iter()
            .map(|c| Bytes::copy_from_slice(c.as_bytes()))
            .collect();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = dyn Fn(usize, &Recorded) -> Result<Reply, ClientError> + Send + Sync;

/// In-memory connector answering from a handler closure.
///
/// The handler receives the zero-based call number and the recorded request.
#[derive(Clone)]
pub struct StubConnector {
    handler: Arc<Handler>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl StubConnector {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(usize, &Recorded) -> Result<Reply, ClientError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers with `reply`
    pub fn replying(reply: Reply) -> Self {
        Self::new(move |_, _| Ok(reply.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Recorded {
        self.requests.lock().last().cloned().unwrap()
    }

    /// Client using this stub, with `http://stub.local` as base URL
    pub fn client(&self) -> ExchangeClient {
        ExchangeClient::builder()
            .base_url("http://stub.local")
            .connector(self.clone())
            .build()
            .unwrap()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, request: ConnectorRequest) -> Result<ConnectorResponse, ClientError> {
        let ConnectorRequest {
            method,
            url,
            headers,
            body,
            ..
        } = request;
        let chunks: Vec<Bytes> = body.into_stream().try_collect().await?;
        let recorded = Recorded {
            method,
            url,
            headers,
            body: Bytes::from(chunks.concat()),
        };

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(recorded.clone());
        let reply = (self.handler)(call, &recorded)?;

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(ConnectorResponse {
            status: reply.status,
            headers: reply.headers,
            body: Box::pin(stream::iter(reply.chunks.into_iter().map(Ok))),
        })
    }
}

/// Transport failure as a connector would report it
pub fn connect_error() -> ClientError {
    ClientError::transport(
        modkit_exchange::TransportErrorKind::Connect,
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
    )
}
