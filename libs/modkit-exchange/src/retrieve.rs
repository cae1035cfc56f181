//! The `retrieve()` facade: status handling followed by body decoding.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::body::BoxStream;
use crate::codec::AnyValue;
use crate::error::ClientError;
use crate::exchange::ExchangeResult;
use crate::response::{ClientResponse, ResponseEntity};

/// What a status handler decided for a matching response.
pub enum StatusOutcome {
    /// Fail the retrieval with this error
    Fail(ClientError),
    /// Ignore the status and decode the body as usual
    Proceed,
    /// Use this value instead of decoding the body.
    ///
    /// Must be the decode target type; sequence retrievals also accept a
    /// `Vec` of it.
    Substitute(AnyValue),
}

impl StatusOutcome {
    #[must_use]
    pub fn substitute<T: Any + Send>(value: T) -> Self {
        StatusOutcome::Substitute(Box::new(value))
    }
}

impl fmt::Debug for StatusOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusOutcome::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            StatusOutcome::Proceed => f.write_str("Proceed"),
            StatusOutcome::Substitute(_) => f.write_str("Substitute(..)"),
        }
    }
}

impl From<ClientError> for StatusOutcome {
    fn from(err: ClientError) -> Self {
        StatusOutcome::Fail(err)
    }
}

type StatusPredicate = Arc<dyn Fn(&StatusCode) -> bool + Send + Sync>;
type StatusHandlerFn =
    Arc<dyn for<'a> Fn(&'a ClientResponse) -> BoxFuture<'a, StatusOutcome> + Send + Sync>;

#[derive(Clone)]
struct StatusHandler {
    predicate: StatusPredicate,
    handler: StatusHandlerFn,
}

/// Result of a successful status check.
enum Checked {
    Decode,
    Substitute(AnyValue),
}

/// Run the first matching handler, falling back to the 4xx/5xx mapping.
async fn check_status(
    handlers: &[StatusHandler],
    response: &ClientResponse,
) -> Result<Checked, ClientError> {
    let status = response.status();
    if let Some(entry) = handlers.iter().find(|h| (h.predicate)(&status)) {
        return match (entry.handler)(response).await {
            StatusOutcome::Fail(err) => {
                response.release_body();
                Err(err)
            }
            StatusOutcome::Proceed => Ok(Checked::Decode),
            StatusOutcome::Substitute(value) => {
                tracing::trace!(log_id = %response.log_id(), status = status.as_u16(), "status handler substituted body");
                response.release_body();
                Ok(Checked::Substitute(value))
            }
        };
    }

    if status.is_client_error() || status.is_server_error() {
        return Err(response.create_error().await);
    }
    Ok(Checked::Decode)
}

fn substitute<T: 'static>(value: AnyValue) -> Result<T, ClientError> {
    value.downcast::<T>().map(|v| *v).map_err(|_| substitute_mismatch::<T>())
}

fn substitute_mismatch<T>() -> ClientError {
    ClientError::Decoding(format!(
        "status handler substitute is not a {}",
        std::any::type_name::<T>()
    ))
}

fn substitute_list<T: Send + 'static>(value: AnyValue) -> Result<Vec<T>, ClientError> {
    match value.downcast::<Vec<T>>() {
        Ok(items) => Ok(*items),
        Err(value) => substitute::<T>(value).map(|item| vec![item]),
    }
}

fn error_stream<T: Send + 'static>(err: ClientError) -> BoxStream<Result<T, ClientError>> {
    Box::pin(stream::iter([Err(err)]))
}

/// Declarative retrieval of a response body.
///
/// Nothing is sent until one of the terminal operations is awaited (or, for
/// [`ResponseSpec::body_to_sequence`], polled). Registered status handlers
/// are checked in order and the first match wins; without a match, 4xx and
/// 5xx statuses fail with [`ClientError::ResponseStatus`].
pub struct ResponseSpec {
    result: ExchangeResult,
    handlers: Vec<StatusHandler>,
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSpec")
            .field("result", &self.result)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ResponseSpec {
    pub(crate) fn new(result: ExchangeResult) -> Self {
        Self {
            result,
            handlers: Vec::new(),
        }
    }

    /// Handle statuses matching `predicate` with an async `handler`.
    ///
    /// ```
    /// # use modkit_exchange::{ResponseSpec, StatusOutcome, ClientError};
    /// # use http::StatusCode;
    /// # fn demo(spec: ResponseSpec) -> ResponseSpec {
    /// spec.on_status(StatusCode::is_client_error, |response| {
    ///     Box::pin(async move {
    ///         let text = response.text().await.unwrap_or_default();
    ///         StatusOutcome::Fail(ClientError::IllegalState(text))
    ///     })
    /// })
    /// # }
    /// ```
    #[must_use]
    pub fn on_status<P, H>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&StatusCode) -> bool + Send + Sync + 'static,
        H: for<'a> Fn(&'a ClientResponse) -> BoxFuture<'a, StatusOutcome> + Send + Sync + 'static,
    {
        self.handlers.push(StatusHandler {
            predicate: Arc::new(predicate),
            handler: Arc::new(handler),
        });
        self
    }

    /// Like [`ResponseSpec::on_status`] with a predicate over the raw code,
    /// for statuses outside the well-known set.
    #[must_use]
    pub fn on_raw_status<P, H>(self, predicate: P, handler: H) -> Self
    where
        P: Fn(u16) -> bool + Send + Sync + 'static,
        H: for<'a> Fn(&'a ClientResponse) -> BoxFuture<'a, StatusOutcome> + Send + Sync + 'static,
    {
        self.on_status(move |status: &StatusCode| predicate(status.as_u16()), handler)
    }

    async fn checked(&self) -> Result<(ClientResponse, Checked), ClientError> {
        let response = self.result.execute().await?;
        let checked = check_status(&self.handlers, &response).await?;
        Ok((response, checked))
    }

    /// Decode the body into one `T`.
    ///
    /// # Errors
    /// Transport and filter errors, status errors, and
    /// [`ClientError::Decoding`] for a missing decoder or a malformed body.
    pub async fn body_to<T>(self) -> Result<T, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.checked().await? {
            (_, Checked::Substitute(value)) => substitute(value),
            (response, Checked::Decode) => response.body_to::<T>().await,
        }
    }

    /// Decode the body into a lazy stream of `T`.
    ///
    /// The exchange starts when the stream is first polled. Every failure,
    /// including status errors, arrives as a stream item.
    #[must_use]
    pub fn body_to_sequence<T>(self) -> BoxStream<Result<T, ClientError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let items = async move {
            let items: BoxStream<Result<T, ClientError>> = match self.checked().await {
                Err(err) => error_stream(err),
                Ok((_, Checked::Substitute(value))) => match substitute_list::<T>(value) {
                    Ok(items) => Box::pin(stream::iter(items.into_iter().map(Ok))),
                    Err(err) => error_stream(err),
                },
                Ok((response, Checked::Decode)) => response.body_to_sequence::<T>(),
            };
            items
        };
        Box::pin(stream::once(items).flatten())
    }

    /// Decode one `T` together with status and headers.
    ///
    /// # Errors
    /// Same as [`ResponseSpec::body_to`].
    pub async fn to_entity<T>(self) -> Result<ResponseEntity<T>, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (response, checked) = self.checked().await?;
        let body = match checked {
            Checked::Substitute(value) => substitute(value)?,
            Checked::Decode => response.body_to::<T>().await?,
        };
        Ok(ResponseEntity {
            status: response.status(),
            headers: response.headers().clone(),
            body,
        })
    }

    /// Decode every `T` in the body together with status and headers.
    ///
    /// # Errors
    /// Same as [`ResponseSpec::body_to`].
    pub async fn to_entity_list<T>(self) -> Result<ResponseEntity<Vec<T>>, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (response, checked) = self.checked().await?;
        let body = match checked {
            Checked::Substitute(value) => substitute_list(value)?,
            Checked::Decode => response.body_to_sequence::<T>().try_collect().await?,
        };
        Ok(ResponseEntity {
            status: response.status(),
            headers: response.headers().clone(),
            body,
        })
    }

    /// Status and headers only; the body is released.
    ///
    /// # Errors
    /// Transport and filter errors and status errors.
    pub async fn to_bodiless_entity(self) -> Result<ResponseEntity<()>, ClientError> {
        let (response, _) = self.checked().await?;
        Ok(response.to_bodiless_entity())
    }
}
