use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Construction-time configuration errors.
///
/// These are raised while a [`CredentialProvider`](crate::CredentialProvider) or a
/// [`QrsClient`](crate::QrsClient) is being built and never later: once a client
/// exists its configuration is known to be usable.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// More than one credential shape was supplied
    #[error("conflicting credentials: {0}")]
    ConflictingCredentials(&'static str),

    /// A credential shape was only partially supplied
    #[error("incomplete credentials: {0}")]
    IncompleteCredential(&'static str),

    /// Ambient credentials with no security context to produce Negotiate tokens
    #[error(
        "ambient credentials need a security context; enable the `negotiate` feature or install one with `security_context`"
    )]
    NoSecurityContext,

    /// Certificate path was set but empty
    #[error("certificate path must not be empty")]
    EmptyCertificatePath,

    /// Certificate, key or CA bundle could not be read or parsed
    #[error("unusable TLS material '{}': {reason}", path.display())]
    TlsMaterial { path: PathBuf, reason: String },

    /// Host is empty or cannot form a base URL
    #[error("invalid host '{0}'")]
    InvalidHost(String),

    /// A configuration field holds a value the client cannot use
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Layered settings (YAML file, environment) failed to load
    #[error("failed to load settings: {0}")]
    Settings(#[from] Box<figment::Error>),
}

/// Broad classification of a [`ClientError`], matching how callers react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Fix the configuration and rebuild the client
    Configuration,
    /// The caller asked for something the client does not support
    Caller,
    /// The server drove the call into a state it cannot finish (redirect loop, failed handshake)
    Protocol,
    /// Connection, TLS, timeout or local I/O failure
    Transport,
}

/// Errors returned by the QRS transport core.
///
/// Non-2xx statuses are NOT errors: they come back as a normal
/// [`QrsResponse`](crate::QrsResponse) and the caller checks the status itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Invalid configuration detected at construction
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// HTTP verb outside GET/POST/PUT/DELETE
    #[error("unsupported HTTP method '{0}'")]
    UnsupportedMethod(String),

    /// Path was absolute or otherwise unusable relative to the base URL
    #[error("invalid request path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Redirect chain exceeded the configured bound
    #[error("too many redirections (limit {max})")]
    TooManyRedirects { max: usize },

    /// Redirect response carried a missing or unusable `Location`
    #[error("invalid redirect target: {0}")]
    InvalidRedirect(String),

    /// A streamed body would have to be sent a second time
    #[error("request body cannot be replayed for {0}")]
    NonReplayableBody(&'static str),

    /// NTLM / Negotiate handshake failed
    #[error("{scheme} authentication failed: {reason}")]
    Auth { scheme: &'static str, reason: String },

    /// URL could not be built
    #[error("invalid URL: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// Header value could not be built
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Request building failed
    #[error("failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Single request attempt timed out
    #[error("request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, etc)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Buffered response body exceeded size limit
    #[error("response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// JSON serialization or parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file I/O failed during upload or download
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal service failure (buffer worker died, channel closed)
    #[error("service unavailable: internal failure")]
    ServiceClosed,
}

impl ClientError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::UnsupportedMethod(_) | Self::InvalidPath { .. } | Self::Json(_) => {
                ErrorKind::Caller
            }
            Self::TooManyRedirects { .. }
            | Self::InvalidRedirect(_)
            | Self::NonReplayableBody(_)
            | Self::Auth { .. }
            | Self::BodyTooLarge { .. } => ErrorKind::Protocol,
            Self::InvalidUri(_)
            | Self::InvalidHeaderValue(_)
            | Self::RequestBuild(_)
            | Self::Timeout(_)
            | Self::Transport(_)
            | Self::Tls(_)
            | Self::Io(_)
            | Self::ServiceClosed => ErrorKind::Transport,
        }
    }

    pub(crate) fn auth(scheme: &'static str, reason: impl Into<String>) -> Self {
        Self::Auth {
            scheme,
            reason: reason.into(),
        }
    }
}

impl From<hyper::Error> for ClientError {
    fn from(err: hyper::Error) -> Self {
        ClientError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for ClientError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ClientError::Transport(Box::new(err))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_transport_error_preserves_source() {
        let err = ClientError::Transport(Box::new(TestError("connection reset")));
        let source = err.source().expect("source should be preserved");
        assert_eq!(source.to_string(), "connection reset");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_tls_error_preserves_source() {
        let err = ClientError::Tls(Box::new(TestError("bad certificate")));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("bad certificate"));
    }

    #[test]
    fn test_too_many_redirects_message() {
        let err = ClientError::TooManyRedirects { max: 30 };
        assert_eq!(err.to_string(), "too many redirections (limit 30)");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: ClientError =
            ConfigError::ConflictingCredentials("certificate and password").into();
        assert_eq!(
            err.to_string(),
            "conflicting credentials: certificate and password"
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_tls_material_message_names_path() {
        let err = ConfigError::TlsMaterial {
            path: PathBuf::from("/certs/client_key.pem"),
            reason: "no private key found".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "unusable TLS material '/certs/client_key.pem': no private key found"
        );
    }

    #[test]
    fn test_unsupported_method_is_caller_error() {
        let err = ClientError::UnsupportedMethod("PATCH".to_owned());
        assert_eq!(err.kind(), ErrorKind::Caller);
        assert_eq!(err.to_string(), "unsupported HTTP method 'PATCH'");
    }
}
