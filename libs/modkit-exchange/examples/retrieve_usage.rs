//! Usage example for the exchange client
//!
//! Reads client settings from `MODKIT_EXCHANGE_*` variables and talks to a
//! JSON API exposing `/users/{login}` and `/users/{login}/events`.
//!
//! To run this example:
//! ```bash
//! export MODKIT_EXCHANGE_BASE_URL="https://api.github.com"
//! export MODKIT_EXCHANGE_TIMEOUT="10s"
//! export MODKIT_EXCHANGE_USER_AGENT="modkit-exchange-example"
//! export EXAMPLE_TOKEN="your-token-here"  # Optional
//! cargo run --example retrieve_usage
//! ```

use futures::StreamExt;
use modkit_exchange::filters::{bearer_authentication, LoggingFilter, RetryFilter};
use modkit_exchange::{ClientSettings, ExchangeClient, StatusCode, StatusOutcome};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct User {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    public_repos: u32,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = ClientSettings::from_env()?;
    let mut builder = settings
        .apply(ExchangeClient::builder())?
        .filter(LoggingFilter)
        .filter(RetryFilter::new(3));
    if let Ok(token) = std::env::var("EXAMPLE_TOKEN") {
        builder = builder.filter(bearer_authentication(&token));
    }
    let client = builder.build()?;

    println!("=== Example 1: Typed body ===\n");

    let user: User = client
        .get()
        .uri("/users/{login}", ["octocat"])?
        .accept(&[mime::APPLICATION_JSON])?
        .retrieve()
        .body_to()
        .await?;
    println!(
        "{} ({}) has {} public repositories\n",
        user.login,
        user.name.as_deref().unwrap_or("no name"),
        user.public_repos
    );

    println!("=== Example 2: Substitute on 404 ===\n");

    let missing: Option<User> = client
        .get()
        .uri("/users/{login}", ["this-user-does-not-exist-42"])?
        .retrieve()
        .on_status(|s| *s == StatusCode::NOT_FOUND, |_| {
            Box::pin(async { StatusOutcome::substitute(None::<User>) })
        })
        .body_to()
        .await?;
    println!("Found: {}\n", missing.is_some());

    println!("=== Example 3: Raw exchange ===\n");

    let response = client.head().uri("/users/{login}", ["octocat"])?.exchange().await?;
    println!("Status: {}", response.status());
    for (name, value) in response.headers() {
        if name.as_str().starts_with("x-ratelimit") {
            println!("  {name}: {}", value.to_str().unwrap_or("<binary>"));
        }
    }
    println!();

    println!("=== Example 4: Streaming a JSON array ===\n");

    let mut events = client
        .get()
        .uri("/users/{login}/events", ["octocat"])?
        .retrieve()
        .body_to_sequence::<Event>()
        .take(5);
    while let Some(event) = events.next().await {
        println!("  {}", event?.kind);
    }

    Ok(())
}
