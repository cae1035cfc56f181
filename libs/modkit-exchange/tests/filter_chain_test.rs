mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_error, Reply, StubConnector};
use http::StatusCode;
use modkit_exchange::filters::{
    basic_authentication, bearer_authentication, limit_response_size, status_error,
    LoggingFilter, RetryFilter,
};
use modkit_exchange::{filter_fn, ClientError, ExchangeFilter};
use parking_lot::Mutex;
use tracing_test::traced_test;

type Log = Arc<Mutex<Vec<String>>>;

fn tagging(log: &Log, name: &'static str) -> impl ExchangeFilter + use<> {
    let log = Arc::clone(log);
    filter_fn(move |request, next| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push(format!("{name}>"));
            let response = next.run(request).await;
            log.lock().push(format!("<{name}"));
            response
        }
    })
}

#[tokio::test]
async fn test_filters_run_in_registration_order() {
    let stub = StubConnector::replying(Reply::status(200));
    let log: Log = Arc::default();

    let client = stub
        .client()
        .mutate()
        .filter(tagging(&log, "f1"))
        .filter(tagging(&log, "f2"))
        .build()
        .unwrap();
    client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(*log.lock(), ["f1>", "f2>", "<f2", "<f1"]);

    log.lock().clear();
    let reversed = stub
        .client()
        .mutate()
        .filter(tagging(&log, "f2"))
        .filter(tagging(&log, "f1"))
        .build()
        .unwrap();
    reversed.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(*log.lock(), ["f2>", "f1>", "<f1", "<f2"]);
}

#[tokio::test]
async fn test_insert_filter_on_mutated_copy() {
    let stub = StubConnector::replying(Reply::status(200));
    let log: Log = Arc::default();

    let original = stub
        .client()
        .mutate()
        .filter(tagging(&log, "a"))
        .filter(tagging(&log, "b"))
        .build()
        .unwrap();
    let extended = original
        .mutate()
        .filters(|filters| filters.insert(0, Arc::new(tagging(&log, "f"))))
        .build()
        .unwrap();

    extended.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(*log.lock(), ["f>", "a>", "b>", "<b", "<a", "<f"]);

    log.lock().clear();
    original.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(*log.lock(), ["a>", "b>", "<b", "<a"]);
}

#[tokio::test]
async fn test_filter_derives_request() {
    let stub = StubConnector::replying(Reply::status(200));
    let client = stub
        .client()
        .mutate()
        .filter(filter_fn(|request, next| async move {
            let request = request.mutate().header("x-derived", "yes")?.build();
            next.run(request).await
        }))
        .build()
        .unwrap();

    client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(stub.last_request().header("x-derived"), Some("yes"));
}

#[tokio::test]
async fn test_short_circuit_error_skips_connector() {
    let stub = StubConnector::replying(Reply::status(200));
    let client = stub
        .client()
        .mutate()
        .filter(filter_fn(|_request, _next| async move {
            Err(ClientError::IllegalState("denied".into()))
        }))
        .build()
        .unwrap();

    let err = client.get().uri("/", ()).unwrap().exchange().await.unwrap_err();
    assert!(matches!(err, ClientError::IllegalState(_)));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn test_next_can_run_twice() {
    let stub = StubConnector::new(|call, _| Ok(Reply::status(if call == 0 { 401 } else { 200 })));
    let client = stub
        .client()
        .mutate()
        .filter(filter_fn(|request, next| async move {
            let first = next.run(request.clone()).await?;
            if first.status() != StatusCode::UNAUTHORIZED {
                return Ok(first);
            }
            first.release_body();
            let request = request.mutate().header("authorization", "Bearer fresh")?.build();
            next.run(request).await
        }))
        .build()
        .unwrap();

    let response = client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(stub.calls(), 2);
    assert_eq!(stub.last_request().header("authorization"), Some("Bearer fresh"));
}

#[tokio::test]
async fn test_basic_authentication() {
    let stub = StubConnector::replying(Reply::status(200));
    let client = stub
        .client()
        .mutate()
        .filter(basic_authentication("user", "pass"))
        .build()
        .unwrap();

    client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(stub.last_request().header("authorization"), Some("Basic dXNlcjpwYXNz"));
}

#[tokio::test]
async fn test_bearer_keeps_explicit_authorization() {
    let stub = StubConnector::replying(Reply::status(200));
    let client = stub
        .client()
        .mutate()
        .filter(bearer_authentication("default-token"))
        .build()
        .unwrap();

    client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(stub.last_request().header("authorization"), Some("Bearer default-token"));

    client
        .get()
        .uri("/", ())
        .unwrap()
        .header("authorization", "Bearer explicit")
        .unwrap()
        .exchange()
        .await
        .unwrap();
    assert_eq!(stub.last_request().header("authorization"), Some("Bearer explicit"));
}

fn fast_retry(max_attempts: u32) -> RetryFilter {
    RetryFilter::new(max_attempts).backoff(Duration::from_millis(1), Duration::from_millis(2))
}

#[tokio::test]
async fn test_retry_until_success() {
    let stub = StubConnector::new(|call, _| Ok(Reply::status(if call < 2 { 503 } else { 200 })));
    let client = stub.client().mutate().filter(fast_retry(3)).build().unwrap();

    let response = client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(stub.calls(), 3);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let stub = StubConnector::replying(Reply::status(502));
    let client = stub.client().mutate().filter(fast_retry(2)).build().unwrap();

    let err = client
        .get()
        .uri("/", ())
        .unwrap()
        .retrieve()
        .body_to::<String>()
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn test_retry_transport_errors_only() {
    let flaky = StubConnector::new(|call, _| if call == 0 { Err(connect_error()) } else { Ok(Reply::status(200)) });
    let client = flaky.client().mutate().filter(fast_retry(3)).build().unwrap();
    client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(flaky.calls(), 2);

    let not_found = StubConnector::replying(Reply::status(404));
    let client = not_found.client().mutate().filter(fast_retry(3)).build().unwrap();
    let response = client.get().uri("/", ()).unwrap().exchange().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(not_found.calls(), 1);
}

#[tokio::test]
async fn test_status_error_applies_to_exchange() {
    let stub = StubConnector::replying(Reply::status(429));
    let client = stub
        .client()
        .mutate()
        .filter(status_error(
            |status| *status == StatusCode::TOO_MANY_REQUESTS,
            |response| ClientError::IllegalState(format!("throttled: {}", response.status())),
        ))
        .build()
        .unwrap();

    let err = client.get().uri("/", ()).unwrap().exchange().await.unwrap_err();
    assert!(matches!(err, ClientError::IllegalState(msg) if msg.starts_with("throttled")));
}

#[tokio::test]
async fn test_limit_response_size() {
    let stub = StubConnector::replying(Reply::status(200).chunks(&["0123456789", "0123456789"]));
    let client = stub
        .client()
        .mutate()
        .filter(limit_response_size(15))
        .build()
        .unwrap();

    let err = client
        .get()
        .uri("/", ())
        .unwrap()
        .retrieve()
        .body_to::<String>()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Decoding(_)));
}

#[tokio::test]
#[traced_test]
async fn test_logging_filter() {
    let stub = StubConnector::replying(Reply::status(204));
    let client = stub.client().mutate().filter(LoggingFilter).build().unwrap();

    client.delete().uri("/persons/{id}", [3]).unwrap().exchange().await.unwrap();

    assert!(logs_contain("HTTP request"));
    assert!(logs_contain("HTTP response"));
    assert!(logs_contain("status=204"));
}
