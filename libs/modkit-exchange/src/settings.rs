use std::collections::BTreeMap;
use std::time::Duration;

use figment::providers::Env;
use figment::Figment;
use serde::{Deserialize, Deserializer};

use crate::client::ClientBuilder;
use crate::codec::Codecs;
use crate::connector::ReqwestConnector;
use crate::error::ClientError;

/// Prefix of the environment variables read by [`ClientSettings::from_env`].
pub const ENV_PREFIX: &str = "MODKIT_EXCHANGE_";

/// Declarative client configuration.
///
/// Durations accept human-readable strings (`"30s"`, `"1m 30s"`) or a plain
/// number of seconds. Nested keys from the environment use `__`, e.g.
/// `MODKIT_EXCHANGE_DEFAULT_HEADERS__X_TENANT=acme`; underscores in header
/// names become dashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Option<Duration>,
    pub max_in_memory_size: Option<usize>,
    pub user_agent: Option<String>,
    pub default_headers: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<DurationValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(DurationValue::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(DurationValue::Text(text)) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl ClientSettings {
    /// Load settings from `MODKIT_EXCHANGE_*` environment variables.
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_figment(&Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract settings from an arbitrary figment, e.g. a service config section.
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if the figment cannot be deserialized.
    pub fn from_figment(figment: &Figment) -> Result<Self, ClientError> {
        figment
            .extract()
            .map_err(|e| ClientError::Build(format!("invalid client settings: {e}")))
    }

    /// Connector honoring the timeout and user-agent settings.
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] if reqwest rejects the configuration.
    pub fn connector(&self) -> Result<ReqwestConnector, ClientError> {
        let mut builder = ReqwestConnector::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }

    /// Apply these settings to `builder`.
    ///
    /// `max_in_memory_size` installs default [`Codecs`] with that limit only
    /// when `builder` has no codecs yet; a registry set by the caller, or
    /// inherited through [`ExchangeClient::mutate`](crate::ExchangeClient::mutate),
    /// is kept with its own limit.
    ///
    /// # Errors
    /// Returns [`ClientError::Build`] for invalid headers or connector settings.
    pub fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder, ClientError> {
        if let Some(base_url) = &self.base_url {
            builder = builder.base_url(base_url.clone());
        }
        for (name, value) in &self.default_headers {
            builder = builder.default_header(name.replace('_', "-"), value.as_str())?;
        }
        if let Some(max) = self.max_in_memory_size
            && !builder.has_codecs()
        {
            builder = builder.codecs(Codecs::builder().max_in_memory_size(max).build());
        }
        Ok(builder.connector(self.connector()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("MODKIT_EXCHANGE_BASE_URL", Some("http://persons.local")),
                ("MODKIT_EXCHANGE_TIMEOUT", Some("1m 30s")),
                ("MODKIT_EXCHANGE_CONNECT_TIMEOUT", Some("5")),
                ("MODKIT_EXCHANGE_MAX_IN_MEMORY_SIZE", Some("1024")),
                ("MODKIT_EXCHANGE_DEFAULT_HEADERS__X_TENANT", Some("acme")),
            ],
            || {
                let settings = ClientSettings::from_env().unwrap();
                assert_eq!(settings.base_url.as_deref(), Some("http://persons.local"));
                assert_eq!(settings.timeout, Some(Duration::from_secs(90)));
                assert_eq!(settings.connect_timeout, Some(Duration::from_secs(5)));
                assert_eq!(settings.max_in_memory_size, Some(1024));
                assert_eq!(
                    settings.default_headers.get("x_tenant").map(String::as_str),
                    Some("acme")
                );
            },
        );
    }

    #[test]
    fn test_defaults_without_env() {
        temp_env::with_vars_unset(
            ["MODKIT_EXCHANGE_BASE_URL", "MODKIT_EXCHANGE_TIMEOUT"],
            || {
                let settings = ClientSettings::from_env().unwrap();
                assert_eq!(settings.base_url, None);
                assert_eq!(settings.timeout, None);
            },
        );
    }

    #[test]
    fn test_invalid_duration() {
        temp_env::with_var("MODKIT_EXCHANGE_TIMEOUT", Some("soon"), || {
            let err = ClientSettings::from_env().unwrap_err();
            assert!(matches!(err, ClientError::Build(_)));
        });
    }
}
