//! Credential configuration and the provider the transport core reads it through.
//!
//! Exactly one of three shapes is active per client:
//!
//! - [`Credentials::Certificate`]: mutual TLS with a client certificate, the
//!   acting user travels in the `X-Qlik-User` header
//! - [`Credentials::Network`]: NTLM with an explicit domain account
//! - [`Credentials::Ambient`]: Negotiate with the process's own OS identity

use crate::auth::{AuthStrategy, NtlmCredentials, SecurityContext, platform_security_context};
use crate::error::ConfigError;
use crate::secret::Password;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

/// Directory of the built-in repository service account
pub const SERVICE_ACCOUNT_DIRECTORY: &str = "internal";

/// User id of the built-in repository service account
pub const SERVICE_ACCOUNT_USER: &str = "sa_repository";

static INSECURE_TLS_WARNING: Once = Once::new();

#[cfg(test)]
static INSECURE_WARNING_COUNT: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

/// Emit the "server certificate verification disabled" warning once per process.
pub(crate) fn warn_insecure_once() {
    INSECURE_TLS_WARNING.call_once(|| {
        #[cfg(test)]
        INSECURE_WARNING_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tracing::warn!(
            target: "qlik_sense_http::security",
            "server certificate verification disabled; any certificate presented by the server is trusted"
        );
    });
}

/// Identity the repository service acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QlikUser {
    pub directory: String,
    pub user_id: String,
}

impl QlikUser {
    #[must_use]
    pub fn new(directory: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            user_id: user_id.into(),
        }
    }

    /// `internal\sa_repository`, used when a certificate client names no user.
    #[must_use]
    pub fn service_account() -> Self {
        Self::new(SERVICE_ACCOUNT_DIRECTORY, SERVICE_ACCOUNT_USER)
    }

    /// Value of the `X-Qlik-User` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("UserDirectory={}; UserId={}", self.directory, self.user_id)
    }
}

impl Default for QlikUser {
    fn default() -> Self {
        Self::service_account()
    }
}

/// Client certificate and private key file pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ClientCertificate {
    /// Pair a certificate with its sibling key file, `client.pem` -> `client_key.pem`.
    #[must_use]
    pub fn from_certificate(cert_path: impl AsRef<Path>) -> Self {
        let cert_path = cert_path.as_ref().to_path_buf();
        let stem = cert_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key_name = match cert_path.extension() {
            Some(ext) => format!("{stem}_key.{}", ext.to_string_lossy()),
            None => format!("{stem}_key"),
        };
        let key_path = cert_path.with_file_name(key_name);
        Self {
            cert_path,
            key_path,
        }
    }
}

/// The active credential shape.
#[derive(Clone)]
pub enum Credentials {
    /// Mutual TLS with a client certificate
    Certificate {
        /// Certificate file; the key is read from the sibling `_key` file
        certificate: PathBuf,
        /// Validate the server certificate (false trusts self-signed servers)
        verify: bool,
        /// Identity sent in `X-Qlik-User`
        user: QlikUser,
    },
    /// NTLM with an explicit account
    Network {
        domain: String,
        username: String,
        password: Password,
    },
    /// Negotiate with the calling process's OS identity
    Ambient,
}

impl Credentials {
    /// Certificate credentials acting as the service account, server certificate not verified.
    #[must_use]
    pub fn certificate(certificate: impl Into<PathBuf>) -> Self {
        Credentials::Certificate {
            certificate: certificate.into(),
            verify: false,
            user: QlikUser::service_account(),
        }
    }

    /// NTLM credentials for `domain\username`.
    #[must_use]
    pub fn network(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Password>,
    ) -> Self {
        Credentials::Network {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Short scheme label used in logs and spans.
    #[must_use]
    pub fn scheme_name(&self) -> &'static str {
        match self {
            Credentials::Certificate { .. } => "certificate",
            Credentials::Network { .. } => "ntlm",
            Credentials::Ambient => "negotiate",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Certificate {
                certificate,
                verify,
                user,
            } => f
                .debug_struct("Certificate")
                .field("certificate", certificate)
                .field("verify", verify)
                .field("user", user)
                .finish(),
            Credentials::Network {
                domain,
                username,
                password: _,
            } => f
                .debug_struct("Network")
                .field("domain", domain)
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Credentials::Ambient => f.write_str("Ambient"),
        }
    }
}

/// Flat, deserializable credential settings.
///
/// Converted into [`Credentials`] with `TryFrom`, which enforces that exactly
/// one shape is described:
///
/// - `certificate` (+ optional `verify`, `directory`, `username`) selects certificate auth
/// - `directory` + `username` + `password` selects NTLM
/// - nothing selects ambient (Negotiate) auth
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    pub certificate: Option<PathBuf>,
    pub verify: Option<bool>,
    pub directory: Option<String>,
    pub username: Option<String>,
    pub password: Option<Password>,
}

impl TryFrom<CredentialsConfig> for Credentials {
    type Error = ConfigError;

    fn try_from(config: CredentialsConfig) -> Result<Self, Self::Error> {
        let CredentialsConfig {
            certificate,
            verify,
            directory,
            username,
            password,
        } = config;

        if let Some(certificate) = certificate {
            if password.is_some() {
                return Err(ConfigError::ConflictingCredentials(
                    "a client certificate and a password cannot both be configured",
                ));
            }
            let user = match (directory, username) {
                (Some(directory), Some(username)) => QlikUser::new(directory, username),
                (None, None) => QlikUser::service_account(),
                _ => {
                    return Err(ConfigError::IncompleteCredential(
                        "directory and username must be given together",
                    ));
                }
            };
            return Ok(Credentials::Certificate {
                certificate,
                verify: verify.unwrap_or(false),
                user,
            });
        }

        if verify == Some(false) {
            return Err(ConfigError::InvalidValue {
                field: "verify",
                reason: "disabling verification requires certificate credentials".to_owned(),
            });
        }

        match (directory, username, password) {
            (None, None, None) => Ok(Credentials::Ambient),
            (Some(domain), Some(username), Some(password)) => Ok(Credentials::Network {
                domain,
                username,
                password,
            }),
            _ => Err(ConfigError::IncompleteCredential(
                "network credentials need directory, username and password",
            )),
        }
    }
}

/// Read-only view of the active credentials for the transport core.
///
/// Built once per client; all validation happens in [`CredentialProvider::new`].
#[derive(Clone)]
pub struct CredentialProvider {
    credentials: Credentials,
    security_context: Option<Arc<dyn SecurityContext>>,
}

impl CredentialProvider {
    /// Validate `credentials` and wrap them.
    ///
    /// Disabling server certificate verification emits a one-time, process-wide warning.
    /// Ambient credentials pick up the platform security context when the
    /// `negotiate` feature provides one.
    ///
    /// # Errors
    /// Returns `ConfigError::EmptyCertificatePath` or `ConfigError::IncompleteCredential`
    /// when a shape is missing required material.
    pub fn new(credentials: Credentials) -> Result<Self, ConfigError> {
        match &credentials {
            Credentials::Certificate {
                certificate,
                verify,
                ..
            } => {
                if certificate.as_os_str().is_empty() {
                    return Err(ConfigError::EmptyCertificatePath);
                }
                if !verify {
                    warn_insecure_once();
                }
            }
            Credentials::Network {
                domain,
                username,
                password,
            } => {
                if domain.is_empty() || username.is_empty() || password.is_empty() {
                    return Err(ConfigError::IncompleteCredential(
                        "network credentials need directory, username and password",
                    ));
                }
            }
            Credentials::Ambient => {}
        }

        tracing::debug!(scheme = credentials.scheme_name(), "credential provider ready");

        let security_context = match &credentials {
            Credentials::Ambient => platform_security_context(),
            Credentials::Certificate { .. } | Credentials::Network { .. } => None,
        };

        Ok(Self {
            credentials,
            security_context,
        })
    }

    /// Install the security context used by ambient (Negotiate) auth,
    /// replacing the platform one.
    #[must_use]
    pub fn with_security_context(mut self, context: Arc<dyn SecurityContext>) -> Self {
        self.security_context = Some(context);
        self
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Value for `X-Qlik-User`, or `None` for ambient identity.
    #[must_use]
    pub fn identity_header_value(&self) -> Option<String> {
        match &self.credentials {
            Credentials::Certificate { user, .. } => Some(user.header_value()),
            Credentials::Network {
                domain, username, ..
            } => Some(QlikUser::new(domain.as_str(), username.as_str()).header_value()),
            Credentials::Ambient => None,
        }
    }

    /// Certificate/key pair to present for mutual TLS.
    #[must_use]
    pub fn client_certificate(&self) -> Option<ClientCertificate> {
        match &self.credentials {
            Credentials::Certificate { certificate, .. } => {
                Some(ClientCertificate::from_certificate(certificate))
            }
            Credentials::Network { .. } | Credentials::Ambient => None,
        }
    }

    /// Whether the server certificate must be validated.
    #[must_use]
    pub fn verify_server_certificate(&self) -> bool {
        match &self.credentials {
            Credentials::Certificate { verify, .. } => *verify,
            Credentials::Network { .. } | Credentials::Ambient => true,
        }
    }

    /// Handshake strategy the connection layer runs for each hop.
    ///
    /// # Errors
    /// Returns `ConfigError::NoSecurityContext` for ambient credentials with no
    /// security context to produce Negotiate tokens.
    pub fn auth_strategy(&self) -> Result<AuthStrategy, ConfigError> {
        let strategy = match &self.credentials {
            Credentials::Certificate { .. } => AuthStrategy::None,
            Credentials::Network {
                domain,
                username,
                password,
            } => AuthStrategy::Ntlm(NtlmCredentials {
                domain: domain.clone(),
                username: username.clone(),
                password: password.clone(),
            }),
            Credentials::Ambient => match &self.security_context {
                Some(context) => AuthStrategy::Negotiate(Arc::clone(context)),
                None => return Err(ConfigError::NoSecurityContext),
            },
        };
        Ok(strategy)
    }

    #[must_use]
    pub fn scheme_name(&self) -> &'static str {
        self.credentials.scheme_name()
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("credentials", &self.credentials)
            .field("security_context", &self.security_context.is_some())
            .finish()
    }
}
