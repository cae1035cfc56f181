use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cookie::Cookie;
use futures::stream::{Stream, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;
use url::Url;

use crate::body::{Body, BoxStream};
use crate::codec::{EncodableValue, TypeDescriptor};
use crate::error::ClientError;

/// Attribute holding the short id that prefixes every log line of one exchange.
pub const LOG_ID_ATTRIBUTE: &str = "modkit_exchange.log_id";

/// Headers where a later value replaces the earlier one instead of appending.
const SINGLE_VALUED: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::HOST,
    header::AUTHORIZATION,
    header::USER_AGENT,
];

pub(crate) fn is_single_valued(name: &HeaderName) -> bool {
    SINGLE_VALUED.contains(name)
}

/// Add `value` under `name`, appending unless the header is single-valued.
pub(crate) fn add_header(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    if is_single_valued(&name) {
        headers.insert(name, value);
    } else {
        headers.append(name, value);
    }
}

/// Overlay `overrides` onto `base` following the append/replace rule.
pub(crate) fn merge_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for name in overrides.keys() {
        if is_single_valued(name) {
            merged.remove(name);
        }
        for value in overrides.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

pub(crate) fn parse_header<K, V>(key: K, value: V) -> Result<(HeaderName, HeaderValue), ClientError>
where
    K: TryInto<HeaderName>,
    V: TryInto<HeaderValue>,
    K::Error: fmt::Display,
    V::Error: fmt::Display,
{
    let key = key
        .try_into()
        .map_err(|e| ClientError::Build(format!("Invalid header name: {e}")))?;
    let value = value
        .try_into()
        .map_err(|e| ClientError::Build(format!("Invalid header value: {e}")))?;
    Ok((key, value))
}

/// Request attributes: per-exchange context visible to filters, never sent.
#[derive(Clone, Default)]
pub struct Attributes {
    inner: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    /// Insert or overwrite `key`
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.inner.insert(key.into(), Arc::new(value));
    }

    #[must_use]
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.inner.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy every entry of `other` over this map.
    pub fn extend_from(&mut self, other: &Attributes) {
        for (k, v) in &other.inner {
            self.inner.insert(k.clone(), Arc::clone(v));
        }
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inner.keys()).finish()
    }
}

/// Request cookies in insertion order; names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    entries: Vec<(String, String)>,
}

impl Cookies {
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values of `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend_from(&mut self, other: &Cookies) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Render as a single `Cookie` header value.
    #[must_use]
    pub fn to_header_value(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .entries
            .iter()
            .map(|(n, v)| Cookie::new(n.as_str(), v.as_str()).encoded().to_string())
            .collect();
        Some(pairs.join("; "))
    }
}

/// Restartable factory for a typed request body sequence.
#[derive(Clone)]
pub struct SequenceBody {
    element: TypeDescriptor,
    factory: Arc<dyn Fn() -> BoxStream<EncodableValue> + Send + Sync>,
}

impl SequenceBody {
    #[must_use]
    pub fn new<T, F, S>(factory: F) -> Self
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            element: TypeDescriptor::of::<T>(),
            factory: Arc::new(move || -> BoxStream<EncodableValue> {
                Box::pin(factory().map(EncodableValue::new))
            }),
        }
    }

    #[must_use]
    pub fn element_type(&self) -> &TypeDescriptor {
        &self.element
    }

    /// Start a fresh pass over the sequence.
    #[must_use]
    pub fn open(&self) -> BoxStream<EncodableValue> {
        (self.factory)()
    }
}

/// Produces the wire body directly, bypassing the codecs.
#[derive(Clone)]
pub struct BodyWriter(Arc<dyn Fn() -> Body + Send + Sync>);

impl BodyWriter {
    #[must_use]
    pub fn new<F>(writer: F) -> Self
    where
        F: Fn() -> Body + Send + Sync + 'static,
    {
        Self(Arc::new(writer))
    }

    #[must_use]
    pub fn write(&self) -> Body {
        (self.0)()
    }
}

/// Body descriptor of a request
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// A single value encoded by the codec registry
    Value(EncodableValue),
    /// A lazy sequence of values encoded element by element
    Sequence(SequenceBody),
    /// A raw body writer
    Writer(BodyWriter),
}

impl RequestBody {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "RequestBody::Empty"),
            RequestBody::Value(v) => f.debug_tuple("RequestBody::Value").field(v.type_descriptor()).finish(),
            RequestBody::Sequence(s) => {
                f.debug_tuple("RequestBody::Sequence").field(s.element_type()).finish()
            }
            RequestBody::Writer(_) => write!(f, "RequestBody::Writer(..)"),
        }
    }
}

/// Immutable HTTP request as seen by filters and the exchange engine.
///
/// Cloning is cheap; derived requests are made with [`ClientRequest::mutate`].
#[derive(Debug, Clone)]
pub struct ClientRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    cookies: Cookies,
    attributes: Attributes,
    body: RequestBody,
    timeout: Option<Duration>,
}

impl ClientRequest {
    /// Start building a request from scratch
    #[must_use]
    pub fn builder(method: Method, url: Url) -> ClientRequestBuilder {
        ClientRequestBuilder {
            inner: ClientRequest {
                method,
                url,
                headers: HeaderMap::new(),
                cookies: Cookies::default(),
                attributes: Attributes::default(),
                body: RequestBody::Empty,
                timeout: None,
            },
        }
    }

    /// Builder seeded with a copy of this request
    #[must_use]
    pub fn mutate(&self) -> ClientRequestBuilder {
        ClientRequestBuilder {
            inner: self.clone(),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[must_use]
    pub fn attribute<T: 'static>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key)
    }

    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Short id used to correlate log lines of this exchange
    #[must_use]
    pub fn log_id(&self) -> &str {
        self.attribute::<String>(LOG_ID_ATTRIBUTE)
            .map_or("-", String::as_str)
    }
}

impl From<&ClientRequest> for ClientRequestBuilder {
    fn from(request: &ClientRequest) -> Self {
        request.mutate()
    }
}

/// Builder producing a [`ClientRequest`]
#[derive(Debug)]
pub struct ClientRequestBuilder {
    inner: ClientRequest,
}

impl ClientRequestBuilder {
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.inner.method = method;
        self
    }

    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.inner.url = url;
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
        add_header(&mut self.inner.headers, key, value);
        Ok(self)
    }

    /// Manipulate the headers directly
    #[must_use]
    pub fn headers(mut self, f: impl FnOnce(&mut HeaderMap)) -> Self {
        f(&mut self.inner.headers);
        self
    }

    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.cookies.add(name, value);
        self
    }

    #[must_use]
    pub fn cookies(mut self, f: impl FnOnce(&mut Cookies)) -> Self {
        f(&mut self.inner.cookies);
        self
    }

    #[must_use]
    pub fn attribute<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.inner.attributes.insert(key, value);
        self
    }

    #[must_use]
    pub fn attributes(mut self, f: impl FnOnce(&mut Attributes)) -> Self {
        f(&mut self.inner.attributes);
        self
    }

    #[must_use]
    pub fn body(mut self, body: RequestBody) -> Self {
        self.inner.body = body;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inner.timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> ClientRequest {
        self.inner
    }
}
