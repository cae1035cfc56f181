//! Ready-made [`ExchangeFilter`]s.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use futures::stream::{self, StreamExt};
use http::header::AUTHORIZATION;
use http::StatusCode;

use crate::body::ByteStream;
use crate::error::ClientError;
use crate::exchange::{filter_fn, ExchangeFilter, Next};
use crate::request::ClientRequest;
use crate::response::ClientResponse;

fn authorization(value: String) -> impl ExchangeFilter {
    let value: Arc<str> = Arc::from(value);
    filter_fn(move |request: ClientRequest, next: Next| {
        let value = Arc::clone(&value);
        async move {
            if request.headers().contains_key(AUTHORIZATION) {
                return next.run(request).await;
            }
            let request = request.mutate().header(AUTHORIZATION, &*value)?.build();
            next.run(request).await
        }
    })
}

/// Add HTTP Basic credentials unless the request already carries `Authorization`.
#[must_use]
pub fn basic_authentication(username: &str, password: &str) -> impl ExchangeFilter + use<> {
    let credentials = BASE64_STANDARD.encode(format!("{username}:{password}"));
    authorization(format!("Basic {credentials}"))
}

/// Add a bearer token unless the request already carries `Authorization`.
#[must_use]
pub fn bearer_authentication(token: &str) -> impl ExchangeFilter + use<> {
    authorization(format!("Bearer {token}"))
}

/// Turn responses whose status matches `predicate` into `to_error(response)`.
///
/// Unlike the status handling of `retrieve()`, this also applies to
/// `exchange()`. The body of a mapped response is released.
#[must_use]
pub fn status_error<P, F>(predicate: P, to_error: F) -> impl ExchangeFilter
where
    P: Fn(&StatusCode) -> bool + Send + Sync + 'static,
    F: Fn(&ClientResponse) -> ClientError + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let to_error = Arc::new(to_error);
    filter_fn(move |request: ClientRequest, next: Next| {
        let predicate = Arc::clone(&predicate);
        let to_error = Arc::clone(&to_error);
        async move {
            let response = next.run(request).await?;
            if predicate(&response.status()) {
                let err = to_error(&response);
                response.release_body();
                return Err(err);
            }
            Ok(response)
        }
    })
}

/// Fail body reads once more than `max_bytes` have been received.
#[must_use]
pub fn limit_response_size(max_bytes: usize) -> impl ExchangeFilter {
    filter_fn(move |request: ClientRequest, next: Next| async move {
        let response = next.run(request).await?;
        Ok(response.map_body(|body| limit_stream(body, max_bytes)))
    })
}

fn limit_stream(body: ByteStream, max_bytes: usize) -> ByteStream {
    Box::pin(stream::unfold(Some((body, 0_usize)), move |state| async move {
        let (mut body, seen) = state?;
        match body.next().await? {
            Ok(chunk) => {
                let seen = seen + chunk.len();
                if seen > max_bytes {
                    let err = ClientError::Decoding(format!(
                        "response body exceeds limit of {max_bytes} bytes"
                    ));
                    return Some((Err(err), None));
                }
                Some((Ok(chunk), Some((body, seen))))
            }
            Err(e) => Some((Err(e), None)),
        }
    }))
}

/// Logs every request and its outcome with the exchange log id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFilter;

#[async_trait]
impl ExchangeFilter for LoggingFilter {
    async fn filter(
        &self,
        request: ClientRequest,
        next: Next,
    ) -> Result<ClientResponse, ClientError> {
        let log_id = request.log_id().to_owned();
        let method = request.method().clone();
        let uri = request.url().clone();
        tracing::info!(log_id = %log_id, method = %method, uri = %uri, "HTTP request");

        let started = Instant::now();
        let result = next.run(request).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &result {
            Ok(response) => tracing::info!(
                log_id = %log_id,
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                elapsed_ms,
                "HTTP response"
            ),
            Err(e) => tracing::warn!(
                log_id = %log_id,
                method = %method,
                uri = %uri,
                error = %e,
                elapsed_ms,
                "HTTP exchange failed"
            ),
        }
        result
    }
}

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

type StatusPredicate = Arc<dyn Fn(&StatusCode) -> bool + Send + Sync>;

/// Re-runs the rest of the chain on transport errors and retryable statuses.
///
/// Attempts are spaced by exponential backoff starting at the initial delay
/// and doubling up to the maximum. Responses that are retried have their
/// body released; the final attempt is returned as is.
#[derive(Clone)]
pub struct RetryFilter {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    retry_on: StatusPredicate,
}

impl fmt::Debug for RetryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFilter")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}

impl RetryFilter {
    /// Up to `max_attempts` attempts in total (at least one), retrying 5xx.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retry_on: Arc::new(StatusCode::is_server_error),
        }
    }

    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Replace the status predicate deciding which responses are retried
    #[must_use]
    pub fn retry_on<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&StatusCode) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .clamp(self.initial_backoff, self.max_backoff)
    }

    fn should_retry(&self, result: &Result<ClientResponse, ClientError>) -> bool {
        match result {
            Ok(response) => (self.retry_on)(&response.status()),
            Err(e) => e.is_transport(),
        }
    }
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl ExchangeFilter for RetryFilter {
    async fn filter(
        &self,
        request: ClientRequest,
        next: Next,
    ) -> Result<ClientResponse, ClientError> {
        let mut attempt = 1;
        loop {
            let result = next.run(request.clone()).await;
            if attempt >= self.max_attempts || !self.should_retry(&result) {
                return result;
            }

            match &result {
                Ok(response) => {
                    response.release_body();
                    tracing::debug!(
                        log_id = %request.log_id(),
                        attempt,
                        status = response.status().as_u16(),
                        "retryable status"
                    );
                }
                Err(e) => {
                    tracing::debug!(log_id = %request.log_id(), attempt, error = %e, "retryable failure");
                }
            }
            drop(result);

            let delay = self.delay(attempt);
            tracing::warn!(
                log_id = %request.log_id(),
                attempt,
                delay_ms = delay.as_millis(),
                "retrying exchange"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let retry = RetryFilter::new(10).backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(retry.delay(4), Duration::from_millis(500));
        assert_eq!(retry.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryFilter::new(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_limit_stream() {
        let chunks = vec![Ok(Bytes::from_static(b"1234")), Ok(Bytes::from_static(b"5678"))];
        let mut limited = limit_stream(Box::pin(stream::iter(chunks)), 6);

        assert_eq!(limited.next().await.unwrap().unwrap(), "1234");
        assert!(matches!(limited.next().await, Some(Err(ClientError::Decoding(_)))));
        assert!(limited.next().await.is_none());
    }
}
