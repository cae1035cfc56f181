use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use mime::Mime;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::body::Body;
use crate::codec::{CodecRegistry, Codecs, EncodableValue};
use crate::connector::{Connector, ReqwestConnector};
use crate::error::ClientError;
use crate::exchange::{compose, DefaultExchangeFunction, ExchangeFilter, ExchangeResult};
use crate::request::{
    add_header, merge_headers, parse_header, Attributes, BodyWriter, ClientRequest, Cookies,
    RequestBody, SequenceBody, LOG_ID_ATTRIBUTE,
};
use crate::response::ClientResponse;
use crate::retrieve::ResponseSpec;
use crate::settings::ClientSettings;
use crate::uri::{UriResolver, UriVariables};

/// Frozen client configuration shared by every request the client issues
#[derive(Clone)]
struct ClientConfig {
    uri: UriResolver,
    default_headers: HeaderMap,
    default_cookies: Cookies,
    default_attributes: Attributes,
    codecs: Arc<dyn CodecRegistry>,
    connector: Arc<dyn Connector>,
    filters: Vec<Arc<dyn ExchangeFilter>>,
}

/// Non-blocking HTTP client.
///
/// Cheap to clone; the configuration is immutable and shared. Derive a
/// differently configured client with [`ExchangeClient::mutate`].
#[derive(Clone)]
pub struct ExchangeClient {
    config: Arc<ClientConfig>,
}

impl fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.config.uri.base().map(Url::as_str))
            .field("default_headers", &self.config.default_headers)
            .field("filters", &self.config.filters.len())
            .finish_non_exhaustive()
    }
}

impl ExchangeClient {
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Client configured from [`ClientSettings`] with a [`ReqwestConnector`]
    ///
    /// # Errors
    /// Returns [`ClientError::UriResolution`] for an invalid base URL and
    /// [`ClientError::Build`] for invalid headers or connector settings.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        settings.apply(Self::builder())?.build()
    }

    /// Builder seeded with a copy of this client's configuration.
    ///
    /// The client itself is not affected by anything done to the builder.
    #[must_use]
    pub fn mutate(&self) -> ClientBuilder {
        let config = self.config.as_ref().clone();
        ClientBuilder {
            base_url: config.uri.base().map(ToString::to_string),
            default_headers: config.default_headers,
            default_cookies: config.default_cookies,
            default_attributes: config.default_attributes,
            codecs: Some(config.codecs),
            connector: Some(config.connector),
            filters: config.filters,
        }
    }

    #[must_use]
    pub fn method(&self, method: Method) -> RequestSpec {
        RequestSpec {
            config: Arc::clone(&self.config),
            method,
            url: None,
            headers: HeaderMap::new(),
            cookies: Cookies::default(),
            attributes: Attributes::default(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    #[must_use]
    pub fn get(&self) -> RequestSpec {
        self.method(Method::GET)
    }

    #[must_use]
    pub fn post(&self) -> RequestSpec {
        self.method(Method::POST)
    }

    #[must_use]
    pub fn put(&self) -> RequestSpec {
        self.method(Method::PUT)
    }

    #[must_use]
    pub fn patch(&self) -> RequestSpec {
        self.method(Method::PATCH)
    }

    #[must_use]
    pub fn delete(&self) -> RequestSpec {
        self.method(Method::DELETE)
    }

    #[must_use]
    pub fn head(&self) -> RequestSpec {
        self.method(Method::HEAD)
    }

    #[must_use]
    pub fn options(&self) -> RequestSpec {
        self.method(Method::OPTIONS)
    }
}

/// Builder for [`ExchangeClient`]
#[derive(Default)]
pub struct ClientBuilder {
    base_url: Option<String>,
    default_headers: HeaderMap,
    default_cookies: Cookies,
    default_attributes: Attributes,
    codecs: Option<Arc<dyn CodecRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    filters: Vec<Arc<dyn ExchangeFilter>>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("default_headers", &self.default_headers)
            .field("default_cookies", &self.default_cookies)
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Base URI that relative request URIs are resolved against
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Header sent with every request
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] for an invalid header name or value.
    pub fn default_header<K, V>(mut self, key: K, value: V) -> Result<Self, ClientError>
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
        K::Error: fmt::Display,
        V::Error: fmt::Display,
    {
        let (key, value) = parse_header(key, value)?;
        add_header(&mut self.default_headers, key, value);
        Ok(self)
    }

    #[must_use]
    pub fn default_headers(mut self, f: impl FnOnce(&mut HeaderMap)) -> Self {
        f(&mut self.default_headers);
        self
    }

    #[must_use]
    pub fn default_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_cookies.add(name, value);
        self
    }

    #[must_use]
    pub fn default_attribute<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.default_attributes.insert(key, value);
        self
    }

    /// Append a filter; filters registered first run outermost
    #[must_use]
    pub fn filter(mut self, filter: impl ExchangeFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Edit the filter list in place, e.g. to insert at a given position
    #[must_use]
    pub fn filters(mut self, f: impl FnOnce(&mut Vec<Arc<dyn ExchangeFilter>>)) -> Self {
        f(&mut self.filters);
        self
    }

    #[must_use]
    pub fn codecs(mut self, codecs: impl CodecRegistry + 'static) -> Self {
        self.codecs = Some(Arc::new(codecs));
        self
    }

    pub(crate) fn has_codecs(&self) -> bool {
        self.codecs.is_some()
    }

    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Build the client
    ///
    /// Without an explicit connector a [`ReqwestConnector`] with default
    /// settings is used; without codecs the default [`Codecs`].
    ///
    /// # Errors
    /// Returns [`ClientError::UriResolution`] for an invalid base URL and
    /// [`ClientError::Build`] if the default connector cannot be created.
    pub fn build(self) -> Result<ExchangeClient, ClientError> {
        let uri = match self.base_url.as_deref() {
            Some(base_url) => UriResolver::with_base(base_url)?,
            None => UriResolver::default(),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(ReqwestConnector::new()?),
        };
        let codecs = self
            .codecs
            .unwrap_or_else(|| Arc::new(Codecs::default()));

        Ok(ExchangeClient {
            config: Arc::new(ClientConfig {
                uri,
                default_headers: self.default_headers,
                default_cookies: self.default_cookies,
                default_attributes: self.default_attributes,
                codecs,
                connector,
                filters: self.filters,
            }),
        })
    }
}

fn new_log_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Fluent builder for a single request.
///
/// Terminal operations ([`RequestSpec::retrieve`], [`RequestSpec::exchange`],
/// [`RequestSpec::exchange_to`]) merge the accumulated state over the client
/// defaults and freeze it into a [`ClientRequest`].
pub struct RequestSpec {
    config: Arc<ClientConfig>,
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    cookies: Cookies,
    attributes: Attributes,
    body: RequestBody,
    timeout: Option<Duration>,
}

impl fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl RequestSpec {
    /// Resolve `template` with `vars` against the client's base URI.
    ///
    /// ```
    /// # use modkit_exchange::{ExchangeClient, ClientError};
    /// # fn demo(client: &ExchangeClient) -> Result<(), ClientError> {
    /// let spec = client.get().uri("/persons/{id}", [42])?;
    /// # drop(spec);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns [`ClientError::UriResolution`] on a missing variable, a
    /// relative URI without base, or an unparseable result.
    pub fn uri<V>(mut self, template: &str, vars: V) -> Result<Self, ClientError>
    where
        V: UriVariables,
    {
        self.url = Some(self.config.uri.resolve(template, &vars)?);
        Ok(self)
    }

    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
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
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.add(name, value);
        self
    }

    #[must_use]
    pub fn cookies(mut self, f: impl FnOnce(&mut Cookies)) -> Self {
        f(&mut self.cookies);
        self
    }

    #[must_use]
    pub fn attribute<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.attributes.insert(key, value);
        self
    }

    /// # Errors
    /// Returns [`ClientError::Build`] if the media type is not a valid header value.
    pub fn content_type(self, media_type: &Mime) -> Result<Self, ClientError> {
        self.header(header::CONTENT_TYPE, media_type.to_string())
    }

    /// Set `Accept` to the given media types.
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if a media type is not a valid header value.
    pub fn accept(mut self, media_types: &[Mime]) -> Result<Self, ClientError> {
        let joined = media_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let (key, value) = parse_header(header::ACCEPT, joined)?;
        self.headers.insert(key, value);
        Ok(self)
    }

    /// Body encoded by the codec registry when the request is written
    #[must_use]
    pub fn body<T>(mut self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.body = RequestBody::Value(EncodableValue::new(value));
        self
    }

    /// Body produced element by element from a fresh stream on every exchange
    #[must_use]
    pub fn body_sequence<T, F, S>(mut self, factory: F) -> Self
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        self.body = RequestBody::Sequence(SequenceBody::new(factory));
        self
    }

    #[must_use]
    pub fn body_iter<I>(self, values: I) -> Self
    where
        I: IntoIterator + Clone + Send + Sync + 'static,
        I::Item: Serialize + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        self.body_sequence(move || stream::iter(values.clone()))
    }

    /// Raw body bytes, sent as is
    #[must_use]
    pub fn body_bytes(self, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        self.body_writer(move || Body::Bytes(bytes.clone()))
    }

    /// Raw body writer, called once per exchange
    #[must_use]
    pub fn body_writer<F>(mut self, writer: F) -> Self
    where
        F: Fn() -> Body + Send + Sync + 'static,
    {
        self.body = RequestBody::Writer(BodyWriter::new(writer));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declarative retrieval with status handling
    #[must_use]
    pub fn retrieve(self) -> ResponseSpec {
        ResponseSpec::new(self.exchange())
    }

    /// Lazy exchange returning the raw response; statuses never fail it
    #[must_use]
    pub fn exchange(self) -> ExchangeResult {
        let RequestSpec {
            config,
            method,
            url,
            headers,
            cookies,
            attributes,
            body,
            timeout,
        } = self;

        let headers = merge_headers(&config.default_headers, &headers);
        let mut all_cookies = config.default_cookies.clone();
        all_cookies.extend_from(&cookies);
        let mut all_attributes = config.default_attributes.clone();
        all_attributes.extend_from(&attributes);
        if !all_attributes.contains(LOG_ID_ATTRIBUTE) {
            all_attributes.insert(LOG_ID_ATTRIBUTE, new_log_id());
        }

        let request = url.map(|url| {
            ClientRequest::builder(method, url)
                .headers(|h| *h = headers)
                .cookies(|c| *c = all_cookies)
                .attributes(|a| *a = all_attributes)
                .body(body)
                .timeout(timeout)
                .build()
        });

        let base = Arc::new(DefaultExchangeFunction::new(
            Arc::clone(&config.connector),
            Arc::clone(&config.codecs),
        ));
        ExchangeResult::new(request, compose(&config.filters, base))
    }

    /// Exchange and hand the response to `f`, releasing the body afterwards.
    ///
    /// # Errors
    /// Whatever the exchange or `f` fail with.
    pub async fn exchange_to<T, F>(self, f: F) -> Result<T, ClientError>
    where
        F: AsyncFnOnce(&ClientResponse) -> Result<T, ClientError>,
    {
        let response = self.exchange().await?;
        let result = f(&response).await;
        response.release_body();
        result
    }
}
