//! Layered settings for building a [`QrsClient`](crate::QrsClient).
//!
//! Precedence, lowest first: built-in defaults, an optional YAML file, then
//! `QLIK__`-prefixed environment variables with `__` separating sections
//! (for example `QLIK__CLIENT__HOST` or `QLIK__CREDENTIALS__CERTIFICATE`).
//!
//! ```yaml
//! client:
//!   host: qlik.example.com
//!   port: 4242
//!   request_timeout: 30s
//! credentials:
//!   certificate: /etc/qlik/client.pem
//!   directory: CORP
//!   username: jdoe
//! ```

use crate::builder::QrsClientBuilder;
use crate::config::ClientConfig;
use crate::credentials::CredentialsConfig;
use crate::error::ConfigError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::Deserialize;
use std::path::Path;

/// Environment prefix for settings overrides
pub const ENV_PREFIX: &str = "QLIK__";

/// Complete client settings as loaded from YAML and the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub client: ClientConfig,
    pub credentials: CredentialsConfig,
}

impl Settings {
    /// Load settings from defaults, `path` (if given) and the environment.
    ///
    /// A missing file is not an error; figment treats it as empty.
    ///
    /// # Errors
    /// Returns `ConfigError::Settings` for malformed YAML, unknown keys or
    /// values of the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::default("client", ClientConfig::default()));
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "loading client settings file");
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Extract settings from an already assembled figment.
    ///
    /// # Errors
    /// Returns `ConfigError::Settings` if extraction fails.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(|e| ConfigError::Settings(Box::new(e)))
    }

    /// Builder configured from these settings.
    ///
    /// Credential shape errors surface from [`QrsClientBuilder::build`].
    pub fn into_builder(self) -> QrsClientBuilder {
        QrsClientBuilder::with_config(self.client).credentials_config(self.credentials)
    }
}
