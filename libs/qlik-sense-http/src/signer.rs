//! Request signing: anti-CSRF key, identity and content headers, query and body.
//!
//! The signer does no I/O. It turns a [`QrsRequest`] plus a caller-supplied
//! [`XrfKey`] into a [`PreparedRequest`] whose URL and headers carry the same
//! key, so the transport core can reuse one key for a whole redirect chain.

use crate::auth::AuthStrategy;
use crate::credentials::CredentialProvider;
use crate::error::ClientError;
use crate::request::{Method, Payload, QrsRequest, QueryParams};
use crate::response::BoxError;
use crate::streaming::FileUpload;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use rand::Rng;
use std::fmt;
use url::Url;

/// Query parameter carrying the anti-CSRF key
pub const XRFKEY_PARAM: &str = "Xrfkey";

/// Header carrying the anti-CSRF key
pub static XRFKEY_HEADER: HeaderName = HeaderName::from_static("x-qlik-xrfkey");

/// Header carrying the acting user
pub static QLIK_USER_HEADER: HeaderName = HeaderName::from_static("x-qlik-user");

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of app files posted to the upload endpoints
pub const CONTENT_TYPE_QLIK_APP: &str = "application/vnd.qlik.sense.app";

/// Body type sent through the connection.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Anti-CSRF key: 16 alphanumeric characters, one per logical call.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct XrfKey(String);

impl XrfKey {
    pub const LEN: usize = 16;

    /// Draw a fresh key from the thread-local CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for XrfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for XrfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("XrfKey").field(&self.0).finish()
    }
}

/// Wire body of a prepared request.
#[derive(Debug)]
pub enum PreparedBody {
    Empty,
    Full(Bytes),
    /// Single-pass file stream; cannot be replayed
    Stream(FileUpload),
}

impl PreparedBody {
    /// Exact length in bytes, known up front for every variant.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            PreparedBody::Empty => 0,
            PreparedBody::Full(bytes) => bytes.len() as u64,
            PreparedBody::Stream(upload) => upload.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy for resending on another hop, `None` for streams.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            PreparedBody::Empty => Some(PreparedBody::Empty),
            PreparedBody::Full(bytes) => Some(PreparedBody::Full(bytes.clone())),
            PreparedBody::Stream(_) => None,
        }
    }

    #[must_use]
    pub fn into_request_body(self) -> RequestBody {
        match self {
            PreparedBody::Empty => Empty::new().map_err(Into::into).boxed_unsync(),
            PreparedBody::Full(bytes) => Full::new(bytes).map_err(Into::into).boxed_unsync(),
            PreparedBody::Stream(upload) => upload.into_body(),
        }
    }
}

/// Wire-ready form of one logical call.
#[derive(Debug)]
pub struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: PreparedBody,
    pub(crate) xrfkey: XrfKey,
}

impl PreparedRequest {
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Full URL including the query string.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Query pairs in wire order; the last pair is always the key.
    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    #[must_use]
    pub fn body(&self) -> &PreparedBody {
        &self.body
    }

    #[must_use]
    pub fn xrfkey(&self) -> &XrfKey {
        &self.xrfkey
    }
}

/// Turns logical requests into prepared ones for one client.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    base_url: Url,
    identity: Option<HeaderValue>,
    strategy: AuthStrategy,
}

impl RequestSigner {
    /// # Errors
    /// Returns `ClientError::InvalidHeaderValue` if the identity cannot be a header value,
    /// and `ConfigError::NoSecurityContext` for ambient credentials nothing can sign for.
    pub fn new(base_url: Url, provider: &CredentialProvider) -> Result<Self, ClientError> {
        let identity = provider
            .identity_header_value()
            .map(HeaderValue::try_from)
            .transpose()?;
        Ok(Self {
            base_url,
            identity,
            strategy: provider.auth_strategy()?,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Headers for every hop of a call signed with `key`.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidHeaderValue` for an unusable content type override.
    pub fn build_headers(
        &self,
        key: &XrfKey,
        content_type: Option<&str>,
    ) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_JSON));
        headers.insert(
            CONTENT_TYPE,
            match content_type {
                Some(value) => HeaderValue::try_from(value)?,
                None => HeaderValue::from_static(CONTENT_TYPE_JSON),
            },
        );
        headers.insert(XRFKEY_HEADER.clone(), HeaderValue::try_from(key.as_str())?);
        if let Some(identity) = &self.identity {
            headers.insert(QLIK_USER_HEADER.clone(), identity.clone());
        }
        self.strategy.apply_headers(&mut headers);
        Ok(headers)
    }

    /// Query pairs: caller parameters in key order, then the anti-CSRF key.
    ///
    /// Booleans render as `true`/`false`, absent values are dropped and a
    /// caller-supplied `Xrfkey` is replaced.
    #[must_use]
    pub fn build_query(&self, key: &XrfKey, params: &QueryParams) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(XRFKEY_PARAM))
            .filter_map(|(name, value)| value.render().map(|v| (name.clone(), v)))
            .collect();
        query.push((XRFKEY_PARAM.to_owned(), key.as_str().to_owned()));
        query
    }

    /// Serialize the payload. Returns the body and the content type it implies.
    ///
    /// # Errors
    /// Returns `ClientError::Json` if the JSON payload cannot be serialized.
    pub fn build_body(
        &self,
        payload: Payload,
    ) -> Result<(PreparedBody, Option<&'static str>), ClientError> {
        let body = match payload {
            Payload::Empty => PreparedBody::Empty,
            Payload::Text(text) if text.is_empty() => PreparedBody::Empty,
            Payload::Text(text) => PreparedBody::Full(Bytes::from(text)),
            Payload::Json(value) => PreparedBody::Full(Bytes::from(serde_json::to_vec(&value)?)),
            Payload::Binary(bytes) => PreparedBody::Full(bytes),
            Payload::Upload(upload) => {
                return Ok((PreparedBody::Stream(upload), Some(CONTENT_TYPE_QLIK_APP)));
            }
        };
        Ok((body, None))
    }

    /// Produce the wire request for `request` under `key`.
    ///
    /// # Errors
    /// Returns the deferred builder error if the request recorded one, or any
    /// error from URL, header or body construction.
    pub fn sign(&self, request: QrsRequest, key: &XrfKey) -> Result<PreparedRequest, ClientError> {
        let QrsRequest {
            method,
            path,
            params,
            payload,
            content_type,
            error,
        } = request;
        if let Some(err) = error {
            return Err(err);
        }

        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        let query = self.build_query(key, &params);
        url.set_query(Some(&encode_query(&query)));

        let (body, implied_type) = self.build_body(payload)?;
        let headers = self.build_headers(key, content_type.as_deref().or(implied_type))?;

        tracing::debug!(
            method = %method,
            url = %url,
            xrfkey = %key,
            body_len = body.len(),
            "signed request"
        );

        Ok(PreparedRequest {
            method,
            url,
            headers,
            query,
            body,
            xrfkey: key.clone(),
        })
    }
}

/// Percent-encode query pairs in order.
pub(crate) fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::NtlmCredentials;
    use crate::credentials::{Credentials, QlikUser};
    use std::collections::HashSet;

    fn signer() -> RequestSigner {
        let provider = CredentialProvider::new(Credentials::Certificate {
            certificate: "/certs/client.pem".into(),
            verify: true,
            user: QlikUser::new("CORP", "jdoe"),
        })
        .unwrap();
        RequestSigner::new(Url::parse("https://qlik.example.com:4242/").unwrap(), &provider)
            .unwrap()
    }

    fn key() -> XrfKey {
        XrfKey("abcdefghij012345".to_owned())
    }

    #[test]
    fn test_xrfkey_shape() {
        let key = XrfKey::generate();
        assert_eq!(key.as_str().len(), XrfKey::LEN);
        assert!(key.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_xrfkeys_differ_across_calls() {
        let keys: HashSet<_> = (0..1000).map(|_| XrfKey::generate()).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_build_query_booleans_and_absent() {
        let mut params = QueryParams::new();
        params.insert("a".to_owned(), true.into());
        params.insert("b".to_owned(), false.into());
        params.insert("c".to_owned(), None::<String>.into());

        let query = signer().build_query(&key(), &params);
        let encoded = encode_query(&query);
        assert!(encoded.contains("a=true&b=false"));
        assert!(!encoded.contains("c="));
        assert_eq!(
            query.last(),
            Some(&("Xrfkey".to_owned(), "abcdefghij012345".to_owned()))
        );
    }

    #[test]
    fn test_caller_xrfkey_is_replaced() {
        let mut params = QueryParams::new();
        params.insert("xrfkey".to_owned(), "stale".into());
        let query = signer().build_query(&key(), &params);
        assert_eq!(query.len(), 1);
        assert_eq!(query[0].1, "abcdefghij012345");
    }

    #[test]
    fn test_build_headers() {
        let headers = signer().build_headers(&key(), None).unwrap();
        assert_eq!(headers[ACCEPT], "application/json");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[&XRFKEY_HEADER], "abcdefghij012345");
        assert_eq!(headers[&QLIK_USER_HEADER], "UserDirectory=CORP; UserId=jdoe");
        assert!(headers.get(http::header::USER_AGENT).is_none());
    }

    #[test]
    fn test_ntlm_signer_adds_windows_user_agent() {
        let provider = CredentialProvider::new(Credentials::network("CORP", "jdoe", "pw")).unwrap();
        let signer =
            RequestSigner::new(Url::parse("https://qlik.example.com:4242/").unwrap(), &provider)
                .unwrap();
        assert!(matches!(provider.auth_strategy(), Ok(AuthStrategy::Ntlm(NtlmCredentials { .. }))));
        let headers = signer.build_headers(&key(), None).unwrap();
        assert_eq!(headers[http::header::USER_AGENT], "Windows");
        assert_eq!(headers[&QLIK_USER_HEADER], "UserDirectory=CORP; UserId=jdoe");
    }

    struct NoTokens;

    impl crate::auth::SecurityContext for NoTokens {
        fn begin(
            &self,
            _service_principal: &str,
        ) -> Result<Box<dyn crate::auth::Negotiation>, ClientError> {
            Err(ClientError::auth("Negotiate", "no tokens in tests"))
        }
    }

    #[test]
    fn test_ambient_signer_has_no_identity() {
        let provider = CredentialProvider::new(Credentials::Ambient)
            .unwrap()
            .with_security_context(std::sync::Arc::new(NoTokens));
        let signer =
            RequestSigner::new(Url::parse("https://qlik.example.com:4242/").unwrap(), &provider)
                .unwrap();
        let headers = signer.build_headers(&key(), None).unwrap();
        assert!(headers.get(&QLIK_USER_HEADER).is_none());
        assert_eq!(headers[http::header::USER_AGENT], "Windows");
    }

    #[cfg(not(feature = "negotiate"))]
    #[test]
    fn test_ambient_signer_without_security_context_fails() {
        let provider = CredentialProvider::new(Credentials::Ambient).unwrap();
        let result =
            RequestSigner::new(Url::parse("https://qlik.example.com:4242/").unwrap(), &provider);
        assert!(matches!(
            result,
            Err(ClientError::Config(crate::error::ConfigError::NoSecurityContext))
        ));
    }

    #[test]
    fn test_build_body_variants() {
        let signer = signer();
        let (body, ct) = signer.build_body(Payload::Text("raw".to_owned())).unwrap();
        assert!(matches!(body, PreparedBody::Full(ref b) if b == "raw"));
        assert!(ct.is_none());

        let (body, _) = signer
            .build_body(Payload::Json(serde_json::json!({"name": "x"})))
            .unwrap();
        assert!(matches!(body, PreparedBody::Full(ref b) if b == r#"{"name":"x"}"#));

        let (body, _) = signer.build_body(Payload::Empty).unwrap();
        assert!(body.is_empty());
        let (body, _) = signer.build_body(Payload::Text(String::new())).unwrap();
        assert!(matches!(body, PreparedBody::Empty));
    }

    #[test]
    fn test_sign_puts_same_key_in_query_and_header() {
        let request = QrsRequest::get("/qrs/app/123").param("privileges", true);
        let prepared = signer().sign(request, &key()).unwrap();

        assert_eq!(
            prepared.url().as_str(),
            "https://qlik.example.com:4242/qrs/app/123?privileges=true&Xrfkey=abcdefghij012345"
        );
        let from_query = prepared
            .url()
            .query_pairs()
            .find(|(k, _)| k == "Xrfkey")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(prepared.headers()[&XRFKEY_HEADER], from_query.as_str());
        assert_eq!(prepared.xrfkey(), &key());
    }

    #[test]
    fn test_sign_encodes_query_values() {
        let request = QrsRequest::get("/qrs/app").param("filter", "name eq 'A&B'");
        let prepared = signer().sign(request, &key()).unwrap();
        assert_eq!(
            prepared.url().query(),
            Some("filter=name%20eq%20%27A%26B%27&Xrfkey=abcdefghij012345")
        );
    }

    #[test]
    fn test_sign_surfaces_deferred_error() {
        let request = QrsRequest::get("http://evil/qrs");
        assert!(matches!(
            signer().sign(request, &key()),
            Err(ClientError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_content_type_override() {
        let request = QrsRequest::post("/qrs/extension/upload")
            .binary(Bytes::from_static(b"PK"))
            .content_type("application/zip");
        let prepared = signer().sign(request, &key()).unwrap();
        assert_eq!(prepared.headers()[CONTENT_TYPE], "application/zip");
        assert_eq!(prepared.body().len(), 2);
    }
}
