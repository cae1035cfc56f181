use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use cookie::{Cookie, SameSite};
use futures::stream::{self, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use mime::Mime;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use url::Url;

use crate::body::{collect_limited, Body, BoxStream, ByteStream};
use crate::codec::{downcast, CodecRegistry, Codecs, DecodeTarget};
use crate::error::{ClientError, ResponseStatusError};
use crate::request::{add_header, parse_header, ClientRequest};

/// Cookie received through `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub max_age: Option<Duration>,
    pub expires: Option<SystemTime>,
    pub same_site: Option<SameSite>,
    pub secure: bool,
    pub http_only: bool,
}

impl ResponseCookie {
    /// Parse one `Set-Cookie` header value. Returns `None` without a `name=value` pair.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match Cookie::parse_encoded(raw) {
            Ok(cookie) => Some(Self::from(&cookie)),
            Err(e) => {
                tracing::debug!(header_value = %raw, error = %e, "ignoring malformed Set-Cookie header");
                None
            }
        }
    }
}

impl From<&Cookie<'_>> for ResponseCookie {
    fn from(cookie: &Cookie<'_>) -> Self {
        Self {
            name: cookie.name().to_owned(),
            value: cookie.value_trimmed().to_owned(),
            domain: cookie.domain().map(str::to_owned),
            path: cookie.path().map(str::to_owned),
            max_age: cookie
                .max_age()
                .and_then(|d| u64::try_from(d.whole_seconds()).ok())
                .map(Duration::from_secs),
            expires: cookie.expires_datetime().map(SystemTime::from),
            same_site: cookie.same_site(),
            secure: cookie.secure().unwrap_or(false),
            http_only: cookie.http_only().unwrap_or(false),
        }
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<ResponseCookie> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(ResponseCookie::parse)
        .collect()
}

/// Status, headers and decoded body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEntity<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: T,
}

enum BodyState {
    Unconsumed(ByteStream),
    Consumed,
    Released,
}

impl BodyState {
    fn name(&self) -> &'static str {
        match self {
            BodyState::Unconsumed(_) => "unconsumed",
            BodyState::Consumed => "consumed",
            BodyState::Released => "released",
        }
    }
}

/// HTTP response handle with a single-use body.
///
/// The body is read lazily from the connector and can be consumed exactly
/// once: decoded, streamed, or released. Any later body operation fails with
/// [`ClientError::IllegalState`]. Dropping the response drops the underlying
/// stream, which hands the connection back to the connector; a response that
/// is kept alive unconsumed keeps its connection busy.
pub struct ClientResponse {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<ResponseCookie>,
    method: Method,
    url: Option<Url>,
    log_id: String,
    body: Mutex<BodyState>,
    codecs: Arc<dyn CodecRegistry>,
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body", &self.body.lock().name())
            .finish_non_exhaustive()
    }
}

impl ClientResponse {
    /// Start a synthetic response, e.g. for a short-circuiting filter
    #[must_use]
    pub fn builder(status: StatusCode) -> ClientResponseBuilder {
        ClientResponseBuilder {
            status,
            headers: HeaderMap::new(),
            body: PendingBody::Readable(Body::Empty),
            method: Method::GET,
            url: None,
            log_id: String::from("-"),
            codecs: None,
        }
    }

    pub(crate) fn from_parts(
        status: StatusCode,
        headers: HeaderMap,
        body: ByteStream,
        request: &ClientRequest,
        codecs: Arc<dyn CodecRegistry>,
    ) -> Self {
        Self {
            status,
            cookies: parse_cookies(&headers),
            headers,
            method: request.method().clone(),
            url: Some(request.url().clone()),
            log_id: request.log_id().to_owned(),
            body: Mutex::new(BodyState::Unconsumed(body)),
            codecs,
        }
    }

    /// Builder seeded with this response, body included
    ///
    /// A consumed or released body stays that way in the built response.
    #[must_use]
    pub fn mutate(self) -> ClientResponseBuilder {
        let body = match self.body.into_inner() {
            BodyState::Unconsumed(stream) => PendingBody::Readable(Body::Stream(stream)),
            BodyState::Consumed => PendingBody::Consumed,
            BodyState::Released => PendingBody::Released,
        };
        ClientResponseBuilder {
            status: self.status,
            headers: self.headers,
            body,
            method: self.method,
            url: self.url,
            log_id: self.log_id,
            codecs: Some(self.codecs),
        }
    }

    /// Replace the body stream with `f(stream)` if it has not been consumed yet.
    #[must_use]
    pub fn map_body<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ByteStream) -> ByteStream,
    {
        let state = self.body.get_mut();
        *state = match std::mem::replace(state, BodyState::Consumed) {
            BodyState::Unconsumed(stream) => BodyState::Unconsumed(f(stream)),
            other => other,
        };
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn cookies(&self) -> &[ResponseCookie] {
        &self.cookies
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Parsed `Content-Type`, if present and valid
    #[must_use]
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Whether the body can still be read
    #[must_use]
    pub fn has_unconsumed_body(&self) -> bool {
        matches!(&*self.body.lock(), BodyState::Unconsumed(_))
    }

    fn take_body(&self) -> Result<ByteStream, ClientError> {
        let mut state = self.body.lock();
        match std::mem::replace(&mut *state, BodyState::Consumed) {
            BodyState::Unconsumed(stream) => Ok(stream),
            other => {
                *state = other;
                Err(ClientError::body_consumed())
            }
        }
    }

    /// Take the raw body chunk stream
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] if the body was already consumed.
    pub fn body_stream(&self) -> Result<ByteStream, ClientError> {
        self.take_body()
    }

    /// Buffer the whole body, up to the registry's in-memory limit
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] on a consumed body, transport
    /// errors while reading, or [`ClientError::Decoding`] above the limit.
    pub async fn bytes(&self) -> Result<Bytes, ClientError> {
        let body = self.take_body()?;
        collect_limited(body, self.codecs.max_in_memory_size()).await
    }

    /// Buffer the body as UTF-8 text
    ///
    /// # Errors
    /// Same as [`ClientResponse::bytes`], plus [`ClientError::Decoding`] for invalid UTF-8.
    pub async fn text(&self) -> Result<String, ClientError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ClientError::Decoding(format!("Invalid UTF-8: {e}")))
    }

    /// Decode the body into a single `T` using the codec registry
    ///
    /// Decoding into `()` discards the body and always succeeds.
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] on a consumed body and
    /// [`ClientError::Decoding`] when no decoder matches or the body is malformed.
    pub async fn body_to<T>(&self) -> Result<T, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let body = self.take_body()?;
        if TypeId::of::<T>() == TypeId::of::<()>() {
            drop(body);
            return downcast(Box::new(()));
        }

        let target = DecodeTarget::of::<T>();
        let media_type = self.content_type();
        let decoder = self
            .codecs
            .find_decoder(&target, media_type.as_ref())
            .ok_or_else(|| no_decoder(&target, media_type.as_ref()))?;

        let bytes = collect_limited(body, self.codecs.max_in_memory_size()).await?;
        tracing::trace!(log_id = %self.log_id, target = target.type_descriptor().name(), len = bytes.len(), "decoding body");
        downcast(decoder.decode(&target, bytes, media_type.as_ref())?)
    }

    /// Decode the body incrementally into a stream of `T`
    ///
    /// Failures, including a consumed body or a missing decoder, are
    /// reported as the first stream item.
    #[must_use]
    pub fn body_to_sequence<T>(&self) -> BoxStream<Result<T, ClientError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let body = match self.take_body() {
            Ok(body) => body,
            Err(e) => return Box::pin(stream::iter([Err(e)])),
        };

        let target = DecodeTarget::of::<T>();
        let media_type = self.content_type();
        let Some(decoder) = self.codecs.find_decoder(&target, media_type.as_ref()) else {
            return Box::pin(stream::iter([Err(no_decoder(&target, media_type.as_ref()))]));
        };

        let values = decoder.decode_stream(target, body, media_type, self.codecs.max_in_memory_size());
        Box::pin(values.map(|v| v.and_then(downcast::<T>)))
    }

    /// Decode into a [`ResponseEntity`]
    ///
    /// # Errors
    /// Same as [`ClientResponse::body_to`].
    pub async fn to_entity<T>(&self) -> Result<ResponseEntity<T>, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let body = self.body_to::<T>().await?;
        Ok(ResponseEntity {
            status: self.status,
            headers: self.headers.clone(),
            body,
        })
    }

    /// Release the body and keep status and headers
    #[must_use]
    pub fn to_bodiless_entity(&self) -> ResponseEntity<()> {
        self.release_body();
        ResponseEntity {
            status: self.status,
            headers: self.headers.clone(),
            body: (),
        }
    }

    /// Drop the unread body, returning the connection to the connector.
    ///
    /// Idempotent; later body operations fail with `IllegalState`.
    pub fn release_body(&self) {
        let released = std::mem::replace(&mut *self.body.lock(), BodyState::Released);
        if let BodyState::Unconsumed(_) = released {
            tracing::trace!(log_id = %self.log_id, "released unread response body");
        }
    }

    /// Build the default status error, buffering whatever body is left.
    ///
    /// The error always carries the status. A body that is already consumed,
    /// exceeds the in-memory limit or fails mid-stream is reported as empty.
    pub async fn create_error(&self) -> ClientError {
        let body = match self.take_body() {
            Ok(stream) => match collect_limited(stream, self.codecs.max_in_memory_size()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(log_id = %self.log_id, status = %self.status, error = %e, "dropping unreadable error body");
                    Bytes::new()
                }
            },
            Err(_) => Bytes::new(),
        };
        ResponseStatusError {
            status: self.status,
            headers: self.headers.clone(),
            body,
            method: self.method.clone(),
            url: self.url.clone(),
        }
        .into()
    }
}

fn no_decoder(target: &DecodeTarget, media_type: Option<&Mime>) -> ClientError {
    let media = media_type.map_or_else(|| "<none>".to_owned(), ToString::to_string);
    ClientError::Decoding(format!(
        "no decoder for {} with content type {media}",
        target.type_descriptor().name()
    ))
}

enum PendingBody {
    Readable(Body),
    Consumed,
    Released,
}

impl PendingBody {
    fn into_state(self) -> BodyState {
        match self {
            PendingBody::Readable(body) => BodyState::Unconsumed(body.into_stream()),
            PendingBody::Consumed => BodyState::Consumed,
            PendingBody::Released => BodyState::Released,
        }
    }
}

impl fmt::Debug for PendingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingBody::Readable(body) => fmt::Debug::fmt(body, f),
            PendingBody::Consumed => f.write_str("Consumed"),
            PendingBody::Released => f.write_str("Released"),
        }
    }
}

/// Builder for a [`ClientResponse`]
pub struct ClientResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
    body: PendingBody,
    method: Method,
    url: Option<Url>,
    log_id: String,
    codecs: Option<Arc<dyn CodecRegistry>>,
}

impl fmt::Debug for ClientResponseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResponseBuilder")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl ClientResponseBuilder {
    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Add a header: appended, or replaced for single-valued headers
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] for an invalid header name or value.
    pub fn header<K, V>(mut self, key: K, value: V) -> Result<Self, ClientError>
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
        K::Error: fmt::Display,
        V::Error: fmt::Display,
    {
        let (key, value) = parse_header(key, value)?;
        add_header(&mut self.headers, key, value);
        Ok(self)
    }

    #[must_use]
    pub fn headers(mut self, f: impl FnOnce(&mut HeaderMap)) -> Self {
        f(&mut self.headers);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = PendingBody::Readable(body.into());
        self
    }

    /// Associate the response with the request that produced it
    #[must_use]
    pub fn request(mut self, request: &ClientRequest) -> Self {
        self.method = request.method().clone();
        self.url = Some(request.url().clone());
        request.log_id().clone_into(&mut self.log_id);
        self
    }

    #[must_use]
    pub fn codecs(mut self, codecs: Arc<dyn CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    #[must_use]
    pub fn build(self) -> ClientResponse {
        ClientResponse {
            status: self.status,
            cookies: parse_cookies(&self.headers),
            headers: self.headers,
            method: self.method,
            url: self.url,
            log_id: self.log_id,
            body: Mutex::new(self.body.into_state()),
            codecs: self
                .codecs
                .unwrap_or_else(|| Arc::new(Codecs::default())),
        }
    }
}
