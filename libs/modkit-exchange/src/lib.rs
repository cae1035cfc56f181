//! Non-blocking HTTP client for ModKit services
//!
//! `modkit_exchange` builds and executes HTTP requests asynchronously, decodes
//! response bodies through pluggable codecs and lets cross-cutting behavior
//! (authentication, logging, retries) be inserted through an ordered filter
//! chain:
//!
//! - a fluent request builder ([`RequestSpec`]) merged over client defaults
//! - a transport seam ([`Connector`]) with a `reqwest` adapter
//! - streaming decode of response bodies as pull-based `futures` streams
//! - filters ([`ExchangeFilter`]) composed first-registered-outermost
//!
//! # Examples
//!
//! ## Retrieve a typed body
//!
//! ```no_run
//! use modkit_exchange::ExchangeClient;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Person {
//!     name: String,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ExchangeClient::builder()
//!     .base_url("http://localhost:8080")
//!     .build()?;
//!
//! let person: Person = client
//!     .get()
//!     .uri("/persons/{id}", [42])?
//!     .retrieve()
//!     .body_to()
//!     .await?;
//! println!("{}", person.name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Status handling and filters
//!
//! ```no_run
//! use modkit_exchange::filters::{bearer_authentication, LoggingFilter, RetryFilter};
//! use modkit_exchange::{ExchangeClient, StatusCode, StatusOutcome};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ExchangeClient::builder()
//!     .base_url("http://localhost:8080")
//!     .filter(LoggingFilter)
//!     .filter(RetryFilter::new(3))
//!     .filter(bearer_authentication("test-token"))
//!     .build()?;
//!
//! let name: String = client
//!     .get()
//!     .uri("/persons/{id}/name", [7])?
//!     .retrieve()
//!     .on_status(|s| *s == StatusCode::NOT_FOUND, |_| {
//!         Box::pin(async { StatusOutcome::substitute(String::from("unknown")) })
//!     })
//!     .body_to()
//!     .await?;
//! # drop(name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Server-sent events
//!
//! ```no_run
//! use futures::StreamExt;
//! use modkit_exchange::{ExchangeClient, SseEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ExchangeClient::builder().build()?;
//!
//! let mut events = client
//!     .get()
//!     .uri("http://localhost:8080/events", ())?
//!     .retrieve()
//!     .body_to_sequence::<SseEvent>();
//!
//! while let Some(event) = events.next().await {
//!     println!("Event: {}", event?.data);
//! }
//! # Ok(())
//! # }
//! ```

mod body;
mod client;
pub mod codec;
pub mod connector;
mod error;
pub mod exchange;
pub mod filters;
mod request;
mod response;
mod retrieve;
mod settings;
pub mod uri;

// Re-export public API
pub use body::{Body, BoxStream, ByteStream};
pub use client::{ClientBuilder, ExchangeClient, RequestSpec};
pub use codec::sse::SseEvent;
pub use codec::{CodecRegistry, Codecs};
pub use connector::{Connector, ReqwestConnector};
pub use error::{BoxError, ClientError, ResponseStatusError, TransportErrorKind};
pub use exchange::{block_on, filter_fn, ExchangeFilter, ExchangeResult, Next};
pub use request::{
    Attributes, BodyWriter, ClientRequest, ClientRequestBuilder, Cookies, RequestBody,
    SequenceBody, LOG_ID_ATTRIBUTE,
};
pub use response::{ClientResponse, ClientResponseBuilder, ResponseCookie, ResponseEntity};
pub use retrieve::{ResponseSpec, StatusOutcome};
pub use settings::{ClientSettings, ENV_PREFIX};

// Re-export commonly used types from dependencies
pub use cookie::SameSite;
pub use http::{HeaderMap, Method, StatusCode};
pub use tokio_util::sync::CancellationToken;
