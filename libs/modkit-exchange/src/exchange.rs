//! Filter chain composition and the exchange engine.
//!
//! Filters are composed once per call into a single [`ExchangeFunction`] by
//! a right fold: the first registered filter is the outermost. The innermost
//! function writes the request body through the codec registry and hands the
//! encoded request to the [`Connector`].

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use http::header::{self, HeaderValue};
use mime::Mime;
use tokio_util::sync::CancellationToken;

use crate::body::Body;
use crate::codec::{frame_sequence, CodecRegistry, Encoder, TypeDescriptor};
use crate::connector::{Connector, ConnectorRequest};
use crate::error::ClientError;
use crate::request::{ClientRequest, RequestBody};
use crate::response::ClientResponse;

/// One request/response cycle: the connector call, possibly wrapped by filters.
#[async_trait]
pub trait ExchangeFunction: Send + Sync {
    async fn exchange(&self, request: ClientRequest) -> Result<ClientResponse, ClientError>;
}

/// Interceptor around the rest of the chain.
///
/// A filter may forward the request (possibly derived through
/// [`ClientRequest::mutate`]), call `next` several times, short-circuit with
/// its own response or error, or map whatever `next` returns.
#[async_trait]
pub trait ExchangeFilter: Send + Sync {
    async fn filter(&self, request: ClientRequest, next: Next)
        -> Result<ClientResponse, ClientError>;
}

/// The remainder of the filter chain, as seen by a filter
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn ExchangeFunction>,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next(..)")
    }
}

impl Next {
    /// Run the rest of the chain. Every call is an independent exchange.
    ///
    /// # Errors
    /// Whatever the inner filters or the connector fail with.
    pub async fn run(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        self.inner.exchange(request).await
    }
}

struct Filtered {
    filter: Arc<dyn ExchangeFilter>,
    next: Next,
}

#[async_trait]
impl ExchangeFunction for Filtered {
    async fn exchange(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        self.filter.filter(request, self.next.clone()).await
    }
}

/// Wrap `base` with `filters`, first filter outermost.
#[must_use]
pub fn compose(
    filters: &[Arc<dyn ExchangeFilter>],
    base: Arc<dyn ExchangeFunction>,
) -> Arc<dyn ExchangeFunction> {
    filters.iter().rev().fold(base, |next, filter| {
        Arc::new(Filtered {
            filter: Arc::clone(filter),
            next: Next { inner: next },
        })
    })
}

/// Filter built from a closure, see [`filter_fn`]
pub struct FilterFn<F>(F);

impl<F> fmt::Debug for FilterFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterFn(..)")
    }
}

/// Adapt an async closure into an [`ExchangeFilter`].
///
/// ```
/// use modkit_exchange::exchange::filter_fn;
///
/// let filter = filter_fn(|request, next| async move {
///     let request = request.mutate().header("x-trace", "1")?.build();
///     next.run(request).await
/// });
/// # drop(filter);
/// ```
#[must_use]
pub fn filter_fn<F, Fut>(f: F) -> FilterFn<F>
where
    F: Fn(ClientRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ClientResponse, ClientError>> + Send + 'static,
{
    FilterFn(f)
}

#[async_trait]
impl<F, Fut> ExchangeFilter for FilterFn<F>
where
    F: Fn(ClientRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ClientResponse, ClientError>> + Send + 'static,
{
    async fn filter(
        &self,
        request: ClientRequest,
        next: Next,
    ) -> Result<ClientResponse, ClientError> {
        (self.0)(request, next).await
    }
}

/// Innermost exchange function: encodes the body and calls the connector.
pub struct DefaultExchangeFunction {
    connector: Arc<dyn Connector>,
    codecs: Arc<dyn CodecRegistry>,
}

impl DefaultExchangeFunction {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, codecs: Arc<dyn CodecRegistry>) -> Self {
        Self { connector, codecs }
    }

    fn find_encoder(
        &self,
        ty: &TypeDescriptor,
        declared: Option<&Mime>,
    ) -> Result<(Arc<dyn Encoder>, Mime), ClientError> {
        let encoder = self.codecs.find_encoder(ty, declared).ok_or_else(|| {
            let media = declared.map_or_else(|| "<none>".to_owned(), ToString::to_string);
            ClientError::Encoding(format!(
                "no encoder for {} with content type {media}",
                ty.name()
            ))
        })?;
        let media_type = declared.cloned().unwrap_or_else(|| encoder.default_media_type());
        Ok((encoder, media_type))
    }

    /// Produce the wire body and the content type to add, if none was declared.
    fn write_body(&self, request: &ClientRequest) -> Result<(Body, Option<Mime>), ClientError> {
        let declared = declared_content_type(request)?;
        let resolved = |media_type: Mime| declared.is_none().then_some(media_type);

        match request.body() {
            RequestBody::Empty => Ok((Body::Empty, None)),
            RequestBody::Writer(writer) => Ok((writer.write(), None)),
            RequestBody::Value(value) => {
                let (encoder, media_type) =
                    self.find_encoder(value.type_descriptor(), declared.as_ref())?;
                let bytes = encoder.encode(value, &media_type)?;
                Ok((Body::Bytes(bytes), resolved(media_type)))
            }
            RequestBody::Sequence(sequence) => {
                let (encoder, media_type) =
                    self.find_encoder(sequence.element_type(), declared.as_ref())?;
                let framing = encoder.framing(&media_type);
                let element_media = media_type.clone();
                let elements = sequence
                    .open()
                    .map(move |value| encoder.encode(&value, &element_media));
                let body = frame_sequence(Box::pin(elements), framing);
                Ok((Body::Stream(body), resolved(media_type)))
            }
        }
    }
}

fn declared_content_type(request: &ClientRequest) -> Result<Option<Mime>, ClientError> {
    let Some(value) = request.headers().get(header::CONTENT_TYPE) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<Mime>().ok())
        .map(Some)
        .ok_or_else(|| ClientError::Encoding(format!("invalid content type {value:?}")))
}

#[async_trait]
impl ExchangeFunction for DefaultExchangeFunction {
    async fn exchange(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        let (body, content_type) = self.write_body(&request)?;

        let mut headers = request.headers().clone();
        if let Some(media_type) = content_type {
            let value = HeaderValue::from_str(media_type.as_ref())
                .map_err(|e| ClientError::Encoding(e.to_string()))?;
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Some(cookie) = request.cookies().to_header_value() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| ClientError::Build(format!("Invalid cookie: {e}")))?;
            headers.insert(header::COOKIE, value);
        }

        tracing::debug!(
            log_id = %request.log_id(),
            method = %request.method(),
            uri = %request.url(),
            "sending request"
        );
        let started = Instant::now();

        let response = self
            .connector
            .connect(ConnectorRequest {
                method: request.method().clone(),
                url: request.url().clone(),
                headers,
                body,
                timeout: request.timeout(),
            })
            .await
            .inspect_err(|e| {
                tracing::debug!(log_id = %request.log_id(), error = %e, "exchange failed");
            })?;

        tracing::debug!(
            log_id = %request.log_id(),
            status = response.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            "received response"
        );

        Ok(ClientResponse::from_parts(
            response.status,
            response.headers,
            response.body,
            &request,
            Arc::clone(&self.codecs),
        ))
    }
}

/// Lazy, re-executable result of `exchange()`.
///
/// Nothing is sent until the result is awaited or [`ExchangeResult::execute`]
/// is polled. Each execution is an independent exchange through the chain
/// captured when the result was created.
pub struct ExchangeResult {
    request: Option<ClientRequest>,
    exchange: Arc<dyn ExchangeFunction>,
    cancellation: Option<CancellationToken>,
}

impl fmt::Debug for ExchangeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeResult")
            .field("request", &self.request)
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

impl ExchangeResult {
    /// `request` is `None` when the builder never received a URI.
    pub(crate) fn new(request: Option<ClientRequest>, exchange: Arc<dyn ExchangeFunction>) -> Self {
        Self {
            request,
            exchange,
            cancellation: None,
        }
    }

    /// The finalized request, if it could be built
    #[must_use]
    pub fn request(&self) -> Option<&ClientRequest> {
        self.request.as_ref()
    }

    /// Fail with [`ClientError::Cancelled`] once `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Run one exchange.
    ///
    /// # Errors
    /// [`ClientError::Build`] without a URI, [`ClientError::Cancelled`] on
    /// cancellation, otherwise whatever the chain fails with. Response
    /// statuses are never mapped to errors here.
    pub async fn execute(&self) -> Result<ClientResponse, ClientError> {
        let request = self
            .request
            .clone()
            .ok_or_else(|| ClientError::Build("no URI given for request".into()))?;
        let exchange = self.exchange.exchange(request);

        match &self.cancellation {
            None => exchange.await,
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(ClientError::Cancelled),
                    result = exchange => result,
                }
            }
        }
    }

    /// Run the exchange on a temporary runtime and buffer the body.
    ///
    /// The returned response keeps its body in memory, so it can be decoded
    /// with [`block_on`] after the runtime is gone.
    ///
    /// # Errors
    /// [`ClientError::IllegalState`] when called from inside a tokio runtime,
    /// plus everything [`ExchangeResult::execute`] and
    /// [`ClientResponse::bytes`] fail with.
    pub fn block(self) -> Result<ClientResponse, ClientError> {
        block_on(async move {
            let response = self.execute().await?;
            let body = response.bytes().await?;
            Ok::<_, ClientError>(response.mutate().body(body).build())
        })?
    }
}

impl IntoFuture for ExchangeResult {
    type Output = Result<ClientResponse, ClientError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.execute().await })
    }
}

/// Drive `future` to completion on a temporary current-thread runtime.
///
/// # Errors
/// Returns [`ClientError::IllegalState`] when called from inside a tokio
/// runtime or when the runtime cannot be created.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, ClientError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(ClientError::IllegalState(
            "blocking call from within an async runtime".into(),
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ClientError::IllegalState(format!("cannot start runtime: {e}")))?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use parking_lot::Mutex;

    struct Fixed(StatusCode);

    #[async_trait]
    impl ExchangeFunction for Fixed {
        async fn exchange(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
            Ok(ClientResponse::builder(self.0).request(&request).build())
        }
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn ExchangeFilter> {
        let log = Arc::clone(log);
        Arc::new(filter_fn(move |request, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}>"));
                let response = next.run(request).await;
                log.lock().push(format!("<{name}"));
                response
            }
        }))
    }

    fn request() -> ClientRequest {
        ClientRequest::builder(Method::GET, "http://x/".parse().unwrap()).build()
    }

    #[tokio::test]
    async fn test_first_filter_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(
            &[recording(&log, "f1"), recording(&log, "f2")],
            Arc::new(Fixed(StatusCode::OK)),
        );
        chain.exchange(request()).await.unwrap();
        assert_eq!(*log.lock(), ["f1>", "f2>", "<f2", "<f1"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let short: Arc<dyn ExchangeFilter> = Arc::new(filter_fn(|request, _next| async move {
            Ok(ClientResponse::builder(StatusCode::IM_A_TEAPOT)
                .request(&request)
                .build())
        }));
        let chain = compose(&[short, recording(&log, "inner")], Arc::new(Fixed(StatusCode::OK)));

        let response = chain.exchange(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_uri_fails_on_execute() {
        let result = ExchangeResult::new(None, Arc::new(Fixed(StatusCode::OK)));
        assert!(matches!(result.execute().await, Err(ClientError::Build(_))));
    }

    #[tokio::test]
    async fn test_block_inside_runtime_is_rejected() {
        let result = ExchangeResult::new(Some(request()), Arc::new(Fixed(StatusCode::OK)));
        assert!(matches!(result.block(), Err(ClientError::IllegalState(_))));
    }

    #[test]
    fn test_block_outside_runtime() {
        let result = ExchangeResult::new(Some(request()), Arc::new(Fixed(StatusCode::ACCEPTED)));
        let response = result.block().unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(block_on(response.text()).unwrap().unwrap(), "");
    }
}
