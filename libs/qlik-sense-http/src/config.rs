use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default User-Agent string for QRS requests
pub const DEFAULT_USER_AGENT: &str = concat!("qlik-sense-http/", env!("CARGO_PKG_VERSION"));

/// Default QRS port when a client certificate is used
pub const DEFAULT_QRS_PORT: u16 = 4242;

/// Default bound on redirect hops for one call
pub const DEFAULT_MAX_REDIRECTS: usize = 30;

/// Default block size for streamed uploads and downloads (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// URL scheme used to reach the repository service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for a [`QrsClient`](crate::QrsClient).
///
/// Credentials are configured separately (see [`CredentialsConfig`](crate::CredentialsConfig))
/// so this struct can be logged freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// `http` or `https` (default: `https`)
    pub scheme: Scheme,

    /// Repository service host name
    pub host: String,

    /// Repository service port (default: 4242)
    pub port: u16,

    /// Maximum redirect hops followed by one call (default: 30)
    ///
    /// A server that redirects more often fails the call with
    /// `ClientError::TooManyRedirects`.
    pub max_redirects: usize,

    /// Per-attempt timeout (default: 30 seconds)
    ///
    /// Applies to each message exchanged, including every redirect hop and
    /// handshake leg.
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,

    /// Maximum size of a buffered response body (default: 10 MiB)
    ///
    /// Streamed downloads are not limited by this value.
    pub max_body_size: usize,

    /// Block size for streamed uploads and downloads (default: 512 KiB)
    pub chunk_size: usize,

    /// User-Agent sent when the auth strategy does not set its own
    pub user_agent: String,

    /// Timeout for idle pooled connections (default: 90 seconds)
    #[serde(with = "humantime_duration::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum idle connections kept per host (default: 4)
    pub pool_max_idle_per_host: usize,

    /// Queue depth of the shared connection service (default: 64)
    pub buffer_capacity: usize,

    /// PEM bundle of trusted CA certificates; the OS store is used when unset
    pub ca_bundle: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Https,
            host: "localhost".to_owned(),
            port: DEFAULT_QRS_PORT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 4,
            buffer_capacity: 64,
            ca_bundle: None,
        }
    }
}

impl ClientConfig {
    /// Configuration for a repository service at `host`, other settings default.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Create configuration for testing with mock servers (plain HTTP, short timeouts)
    ///
    /// **WARNING**: never use in production, traffic is not encrypted.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            scheme: Scheme::Http,
            host: "127.0.0.1".to_owned(),
            port: 80,
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            pool_idle_timeout: Some(Duration::from_secs(10)),
            buffer_capacity: 16,
            ..Self::default()
        }
    }

    /// Check the configuration can produce a working client.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidHost` for an empty or unparsable host and
    /// `ConfigError::InvalidValue` for zero sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_body_size",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout",
                reason: "must be greater than zero".to_owned(),
            });
        }
        self.base_url().map(|_| ())
    }

    /// `scheme://host:port/`, the URL every request path is resolved against.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidHost` if the host cannot form a URL.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let host = self.host.trim();
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_owned()
        };
        let url = Url::parse(&format!("{}://{host}:{}/", self.scheme, self.port))
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        Ok(url)
    }
}

/// `Duration` (de)serialization through humantime strings such as `"30s"` or `"1m 30s"`.
///
/// Bare integers are accepted as seconds, which is what environment variables
/// tend to produce.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    impl Raw {
        fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
                Raw::Text(text) => humantime::parse_duration(text.trim())
                    .map_err(|e| E::custom(format!("invalid duration '{text}': {e}"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Raw::deserialize(d)?.into_duration()
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => s.collect_str(&humantime::format_duration(*d)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(d)?
                .map(Raw::into_duration)
                .transpose()
        }
    }
}
