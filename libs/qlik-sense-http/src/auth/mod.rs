//! Connection-level authentication handshakes.
//!
//! Certificate clients authenticate during the TLS handshake and need nothing
//! here. NTLM and Negotiate clients run a challenge/response exchange on every
//! hop: the transport core asks the strategy for a [`Handshake`], sends the
//! initial `Authorization` value on a body-less probe, and feeds the server's
//! `WWW-Authenticate` challenge back in to obtain the final value.

#[cfg(feature = "negotiate")]
pub mod negotiate;
pub mod ntlm;

use crate::error::ClientError;
use crate::secret::Password;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::header::{USER_AGENT, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// User-Agent the repository service expects from Windows-authenticated clients
pub const WINDOWS_USER_AGENT: &str = "Windows";

/// Explicit account for NTLM.
#[derive(Clone)]
pub struct NtlmCredentials {
    pub domain: String,
    pub username: String,
    pub password: Password,
}

impl fmt::Debug for NtlmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

/// Platform security context (SSPI, GSSAPI) producing Negotiate tokens for
/// the calling process's own identity.
pub trait SecurityContext: Send + Sync {
    /// Start a token exchange with the service principal `HTTP/<host>`.
    ///
    /// # Errors
    /// Returns an error if the platform cannot acquire credentials.
    fn begin(&self, service_principal: &str) -> Result<Box<dyn Negotiation>, ClientError>;
}

/// Security context of the current platform, if the crate was built with one.
///
/// With the `negotiate` feature this is the system Kerberos/SPNEGO stack
/// (GSSAPI on Unix, SSPI on Windows); without it there is none and ambient
/// credentials need a context installed explicitly.
#[must_use]
pub fn platform_security_context() -> Option<Arc<dyn SecurityContext>> {
    #[cfg(feature = "negotiate")]
    {
        Some(Arc::new(negotiate::PlatformContext))
    }
    #[cfg(not(feature = "negotiate"))]
    {
        None
    }
}

/// One in-progress Negotiate exchange.
pub trait Negotiation: Send {
    /// Produce the next token. `challenge` is `None` for the first token and the
    /// decoded server token afterwards. `Ok(None)` means the exchange is complete.
    ///
    /// # Errors
    /// Returns an error if the platform rejects the server token.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, ClientError>;
}

/// How requests are authenticated at the connection level.
#[derive(Clone, Default)]
pub enum AuthStrategy {
    /// Nothing to do beyond TLS (certificate clients)
    #[default]
    None,
    /// NTLMv2 challenge/response with explicit credentials
    Ntlm(NtlmCredentials),
    /// SPNEGO with the process identity, tokens from a security context
    Negotiate(Arc<dyn SecurityContext>),
}

impl AuthStrategy {
    /// Headers this strategy adds to every request.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        match self {
            AuthStrategy::None => {}
            AuthStrategy::Ntlm(_) | AuthStrategy::Negotiate(_) => {
                headers.insert(USER_AGENT, HeaderValue::from_static(WINDOWS_USER_AGENT));
            }
        }
    }

    /// Start the handshake for one hop towards `target`.
    pub(crate) fn handshake(&self, target: &Url) -> Result<Option<Box<dyn Handshake>>, ClientError> {
        match self {
            AuthStrategy::None => Ok(None),
            AuthStrategy::Ntlm(credentials) => {
                Ok(Some(Box::new(ntlm::NtlmHandshake::new(credentials.clone()))))
            }
            AuthStrategy::Negotiate(context) => {
                let host = target.host_str().unwrap_or_default();
                let negotiation = context.begin(&format!("HTTP/{host}"))?;
                Ok(Some(Box::new(NegotiateHandshake {
                    negotiation,
                    responded: false,
                })))
            }
        }
    }
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::None => f.write_str("None"),
            AuthStrategy::Ntlm(credentials) => f.debug_tuple("Ntlm").field(credentials).finish(),
            AuthStrategy::Negotiate(_) => f.write_str("Negotiate(SecurityContext)"),
        }
    }
}

/// Per-hop challenge/response state machine.
pub(crate) trait Handshake: Send {
    fn scheme(&self) -> &'static str;

    /// `Authorization` value for the probe leg.
    fn initial(&mut self) -> Result<Option<HeaderValue>, ClientError>;

    /// `Authorization` value answering a 401 challenge, `None` to give up and
    /// hand the 401 to the caller.
    fn respond(&mut self, headers: &HeaderMap) -> Result<Option<HeaderValue>, ClientError>;
}

/// What a 401 response says about one auth scheme.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Challenge {
    /// Scheme not offered
    Absent,
    /// Scheme offered without a token
    Offered,
    /// Scheme offered with a decoded token
    Token(Vec<u8>),
}

pub(crate) fn parse_challenge(
    headers: &HeaderMap,
    scheme: &'static str,
) -> Result<Challenge, ClientError> {
    for value in headers.get_all(WWW_AUTHENTICATE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let mut parts = value.trim().splitn(2, ' ');
        let name = parts.next().unwrap_or_default();
        if !name.eq_ignore_ascii_case(scheme) {
            continue;
        }
        return match parts.next().map(str::trim).filter(|t| !t.is_empty()) {
            None => Ok(Challenge::Offered),
            Some(token) => BASE64
                .decode(token)
                .map(Challenge::Token)
                .map_err(|e| ClientError::auth(scheme, format!("malformed challenge token: {e}"))),
        };
    }
    Ok(Challenge::Absent)
}

pub(crate) fn authorization_value(
    scheme: &'static str,
    token: &[u8],
) -> Result<HeaderValue, ClientError> {
    let mut value = HeaderValue::try_from(format!("{scheme} {}", BASE64.encode(token)))?;
    value.set_sensitive(true);
    Ok(value)
}

struct NegotiateHandshake {
    negotiation: Box<dyn Negotiation>,
    responded: bool,
}

const NEGOTIATE: &str = "Negotiate";

impl Handshake for NegotiateHandshake {
    fn scheme(&self) -> &'static str {
        NEGOTIATE
    }

    fn initial(&mut self) -> Result<Option<HeaderValue>, ClientError> {
        self.negotiation
            .step(None)?
            .map(|token| authorization_value(NEGOTIATE, &token))
            .transpose()
    }

    fn respond(&mut self, headers: &HeaderMap) -> Result<Option<HeaderValue>, ClientError> {
        if self.responded {
            return Ok(None);
        }
        self.responded = true;
        match parse_challenge(headers, NEGOTIATE)? {
            Challenge::Token(token) => self
                .negotiation
                .step(Some(&token))?
                .map(|next| authorization_value(NEGOTIATE, &next))
                .transpose(),
            Challenge::Absent | Challenge::Offered => Ok(None),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Security context handing out scripted tokens and recording what it saw.
    #[derive(Default)]
    struct ScriptedContext {
        principals: Mutex<Vec<String>>,
        challenges: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct ScriptedNegotiation {
        challenges: Arc<Mutex<Vec<Vec<u8>>>>,
        step: usize,
    }

    impl SecurityContext for ScriptedContext {
        fn begin(&self, service_principal: &str) -> Result<Box<dyn Negotiation>, ClientError> {
            self.principals
                .lock()
                .unwrap()
                .push(service_principal.to_owned());
            Ok(Box::new(ScriptedNegotiation {
                challenges: self.challenges.clone(),
                step: 0,
            }))
        }
    }

    impl Negotiation for ScriptedNegotiation {
        fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, ClientError> {
            if let Some(challenge) = challenge {
                self.challenges.lock().unwrap().push(challenge.to_vec());
            }
            self.step += 1;
            Ok(Some(format!("token-{}", self.step).into_bytes()))
        }
    }

    fn challenge_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_windows_user_agent_for_integrated_auth() {
        let mut headers = HeaderMap::new();
        AuthStrategy::Negotiate(Arc::new(ScriptedContext::default())).apply_headers(&mut headers);
        assert_eq!(headers[USER_AGENT], "Windows");

        let mut headers = HeaderMap::new();
        AuthStrategy::None.apply_headers(&mut headers);
        assert!(headers.get(USER_AGENT).is_none());
    }

    #[test]
    fn test_parse_challenge_variants() {
        let headers = challenge_headers("NTLM");
        assert_eq!(parse_challenge(&headers, "NTLM").unwrap(), Challenge::Offered);
        assert_eq!(
            parse_challenge(&headers, "Negotiate").unwrap(),
            Challenge::Absent
        );

        let headers = challenge_headers("ntlm dG9rZW4=");
        assert_eq!(
            parse_challenge(&headers, "NTLM").unwrap(),
            Challenge::Token(b"token".to_vec())
        );

        let headers = challenge_headers("NTLM !!!");
        assert!(matches!(
            parse_challenge(&headers, "NTLM"),
            Err(ClientError::Auth { scheme: "NTLM", .. })
        ));
    }

    #[test]
    fn test_parse_challenge_scans_all_headers() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
        assert_eq!(parse_challenge(&headers, "NTLM").unwrap(), Challenge::Offered);
    }

    #[test]
    fn test_certificate_strategy_has_no_handshake() {
        let url = Url::parse("https://qlik.example.com:4242/").unwrap();
        assert!(AuthStrategy::None.handshake(&url).unwrap().is_none());
    }

    #[cfg(not(feature = "negotiate"))]
    #[test]
    fn test_no_platform_context_without_feature() {
        assert!(platform_security_context().is_none());
    }

    #[test]
    fn test_negotiate_begin_failure_is_auth_error() {
        struct Unavailable;
        impl SecurityContext for Unavailable {
            fn begin(&self, _service_principal: &str) -> Result<Box<dyn Negotiation>, ClientError> {
                Err(ClientError::auth(NEGOTIATE, "no ticket"))
            }
        }
        let url = Url::parse("https://qlik.example.com:4242/").unwrap();
        let result = AuthStrategy::Negotiate(Arc::new(Unavailable)).handshake(&url);
        assert!(matches!(result, Err(ClientError::Auth { scheme: "Negotiate", .. })));
    }

    #[test]
    fn test_negotiate_exchange() {
        let context = Arc::new(ScriptedContext::default());
        let strategy = AuthStrategy::Negotiate(context.clone());
        let url = Url::parse("https://qlik.example.com:4242/qrs/app").unwrap();

        let mut handshake = strategy.handshake(&url).unwrap().unwrap();
        assert_eq!(handshake.scheme(), "Negotiate");
        assert_eq!(
            context.principals.lock().unwrap().as_slice(),
            ["HTTP/qlik.example.com"]
        );

        let first = handshake.initial().unwrap().unwrap();
        assert_eq!(first, "Negotiate dG9rZW4tMQ==");
        assert!(first.is_sensitive());

        let second = handshake
            .respond(&challenge_headers("Negotiate c2VydmVy"))
            .unwrap()
            .unwrap();
        assert_eq!(second, "Negotiate dG9rZW4tMg==");
        assert_eq!(
            context.challenges.lock().unwrap().as_slice(),
            [b"server".to_vec()]
        );

        // one answer per hop
        assert!(
            handshake
                .respond(&challenge_headers("Negotiate c2VydmVy"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_strategy_debug_hides_secrets() {
        let strategy = AuthStrategy::Ntlm(NtlmCredentials {
            domain: "CORP".to_owned(),
            username: "jdoe".to_owned(),
            password: Password::new("hunter2"),
        });
        let dbg = format!("{strategy:?}");
        assert!(dbg.contains("CORP"));
        assert!(!dbg.contains("hunter2"));
    }
}
