use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use http::StatusCode;
use httpmock::prelude::*;
use modkit_exchange::filters::bearer_authentication;
use modkit_exchange::{block_on, ClientError, ClientSettings, ExchangeClient};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Person {
    name: String,
}

fn client_for(server: &MockServer) -> ExchangeClient {
    ExchangeClient::builder()
        .base_url(server.base_url())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_json_post() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/persons")
                .header("content-type", "application/json")
                .header("Authorization", "Bearer test-token")
                .json_body(json!({"name": "Jason"}));
            then.status(201)
                .header("Content-Type", "application/json")
                .json_body(json!({"name": "Jason"}));
        })
        .await;

    let client = client_for(&server)
        .mutate()
        .filter(bearer_authentication("test-token"))
        .build()
        .unwrap();

    let entity = client
        .post()
        .uri("/persons", ())
        .unwrap()
        .body(Person { name: "Jason".into() })
        .retrieve()
        .to_entity::<Person>()
        .await
        .unwrap();

    assert_eq!(entity.status, StatusCode::CREATED);
    assert_eq!(entity.body.name, "Jason");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_get_with_query_and_headers() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/persons/42")
                .query_param("expand", "address")
                .header("x-tenant", "acme")
                .header("accept", "application/json");
            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({"name": "Jason"}));
        })
        .await;

    let client = client_for(&server)
        .mutate()
        .default_header("x-tenant", "acme")
        .unwrap()
        .build()
        .unwrap();

    let person: Person = client
        .get()
        .uri("/persons/{id}?expand={what}", (42, "address"))
        .unwrap()
        .accept(&[mime::APPLICATION_JSON])
        .unwrap()
        .retrieve()
        .body_to()
        .await
        .unwrap();

    assert_eq!(person.name, "Jason");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_not_found_maps_to_status_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/persons/7");
            then.status(404).body("no person 7");
        })
        .await;

    let err = client_for(&server)
        .get()
        .uri("/persons/{id}", [7])
        .unwrap()
        .retrieve()
        .body_to::<Person>()
        .await
        .unwrap_err();

    let ClientError::ResponseStatus(details) = err else {
        panic!("expected status error, got {err:?}");
    };
    assert_eq!(details.status, StatusCode::NOT_FOUND);
    assert_eq!(details.body_text(), "no person 7");
}

#[tokio::test]
async fn test_text_and_bytes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/greeting");
            then.status(200)
                .header("Content-Type", "text/plain")
                .body("Hello, World!");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/blob");
            then.status(200)
                .header("Content-Type", "application/octet-stream")
                .body(vec![0_u8, 1, 2, 3]);
        })
        .await;

    let client = client_for(&server);
    let text: String = client
        .get()
        .uri("/greeting", ())
        .unwrap()
        .retrieve()
        .body_to()
        .await
        .unwrap();
    assert_eq!(text, "Hello, World!");

    let blob: Bytes = client
        .get()
        .uri("/blob", ())
        .unwrap()
        .retrieve()
        .body_to()
        .await
        .unwrap();
    assert_eq!(blob.as_ref(), &[0, 1, 2, 3]);
}

#[tokio::test]
async fn test_streamed_ndjson_response() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/persons");
            then.status(200)
                .header("Content-Type", "application/x-ndjson")
                .body("{\"name\":\"a\"}\n{\"name\":\"b\"}\n");
        })
        .await;

    let people: Vec<Person> = client_for(&server)
        .get()
        .uri("/persons", ())
        .unwrap()
        .retrieve()
        .body_to_sequence()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(people.len(), 2);
}

#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(5));
        })
        .await;

    let err = client_for(&server)
        .get()
        .uri("/slow", ())
        .unwrap()
        .timeout(Duration::from_millis(100))
        .exchange()
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_client_from_settings() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ping")
                .header("x-tenant", "acme")
                .header("user-agent", "persons-service/1.0");
            then.status(204);
        })
        .await;

    let settings = ClientSettings {
        base_url: Some(server.base_url()),
        timeout: Some(Duration::from_secs(5)),
        user_agent: Some("persons-service/1.0".into()),
        default_headers: [("x_tenant".to_owned(), "acme".to_owned())].into(),
        ..ClientSettings::default()
    };
    let client = ExchangeClient::from_settings(&settings).unwrap();

    let entity = client
        .get()
        .uri("/ping", ())
        .unwrap()
        .retrieve()
        .to_bodiless_entity()
        .await
        .unwrap();
    assert_eq!(entity.status, StatusCode::NO_CONTENT);
    mock.assert_async().await;
}

#[test]
fn test_blocking_exchange() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/persons/1");
        then.status(200)
            .header("Content-Type", "application/json")
            .json_body(json!({"name": "Jason"}));
    });

    let client = client_for(&server);
    let response = client
        .get()
        .uri("/persons/{id}", [1])
        .unwrap()
        .exchange()
        .block()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let person: Person = block_on(response.body_to()).unwrap().unwrap();
    assert_eq!(person.name, "Jason");
    mock.assert();
}

#[tokio::test]
async fn test_blocking_inside_runtime_is_rejected() {
    let server = MockServer::start_async().await;
    let err = client_for(&server)
        .get()
        .uri("/", ())
        .unwrap()
        .exchange()
        .block()
        .unwrap_err();
    assert!(matches!(err, ClientError::IllegalState(_)));
}
