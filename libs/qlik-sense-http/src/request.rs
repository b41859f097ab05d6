//! Caller-facing request description.
//!
//! A [`QrsRequest`] names a path relative to the repository base URL, its query
//! parameters and a payload. It carries no headers: the signer derives all of
//! them from the credentials and the payload kind.

use crate::error::ClientError;
use crate::streaming::FileUpload;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP verbs the repository API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    #[must_use]
    pub fn to_http(self) -> http::Method {
        match self {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Delete => http::Method::DELETE,
        }
    }
}

impl FromStr for Method {
    type Err = ClientError;

    /// Case-insensitive; anything outside the four supported verbs is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(ClientError::UnsupportedMethod(s.to_owned())),
        }
    }
}

impl TryFrom<&http::Method> for Method {
    type Error = ClientError;

    fn try_from(method: &http::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One query parameter value.
///
/// Booleans are rendered as `true`/`false`; `Absent` parameters are dropped
/// from the query string entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Str(String),
    Bool(bool),
    Absent,
}

impl QueryValue {
    /// Wire form, `None` when the parameter is omitted.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            QueryValue::Str(s) => Some(s.clone()),
            QueryValue::Bool(b) => Some(if *b { "true" } else { "false" }.to_owned()),
            QueryValue::Absent => None,
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Str(value.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Str(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Bool(value)
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Str(value.to_string())
    }
}

impl From<u32> for QueryValue {
    fn from(value: u32) -> Self {
        QueryValue::Str(value.to_string())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(QueryValue::Absent, Into::into)
    }
}

/// Query parameters in the order they are sent.
pub type QueryParams = BTreeMap<String, QueryValue>;

/// Request body as supplied by the caller.
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Sent verbatim; an empty string means no body
    Text(String),
    /// Serialized as JSON
    Json(serde_json::Value),
    Binary(Bytes),
    /// Streamed from a local file in bounded chunks
    Upload(FileUpload),
}

impl Payload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Text(text) => text.is_empty(),
            Payload::Json(_) => false,
            Payload::Binary(bytes) => bytes.is_empty(),
            Payload::Upload(upload) => upload.is_empty(),
        }
    }
}

/// A request against the repository service.
///
/// # Example
///
/// ```ignore
/// let request = QrsRequest::get("/qrs/app")
///     .param("filter", "name eq 'Sales'")
///     .param("privileges", true);
/// let response = client.execute(request).await?;
/// ```
#[must_use = "QrsRequest does nothing until passed to QrsClient::execute"]
#[derive(Debug)]
pub struct QrsRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) params: QueryParams,
    pub(crate) payload: Payload,
    pub(crate) content_type: Option<String>,
    /// Error captured during building, surfaced by `execute`
    pub(crate) error: Option<ClientError>,
}

impl QrsRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let error = validate_path(&path).err();
        Self {
            method,
            path,
            params: QueryParams::new(),
            payload: Payload::Empty,
            content_type: None,
            error,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Add or replace one query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: QueryParams) -> Self {
        self.params.extend(params);
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.payload = Payload::Text(body.into());
        self
    }

    /// Serialize `body` as the JSON payload.
    ///
    /// A serialization failure is reported when the request is executed.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_value(body) {
            Ok(value) => self.payload = Payload::Json(value),
            Err(e) => self.error = Some(ClientError::Json(e)),
        }
        self
    }

    pub fn json_value(mut self, body: serde_json::Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub fn binary(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Payload::Binary(body.into());
        self
    }

    /// Override the `Content-Type` derived from the payload kind.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub(crate) fn upload(mut self, upload: FileUpload) -> Self {
        self.payload = Payload::Upload(upload);
        self
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query_params(&self) -> &QueryParams {
        &self.params
    }
}

fn validate_path(path: &str) -> Result<(), ClientError> {
    let reason = if path.contains("://") {
        "must be relative to the repository base URL"
    } else if path.contains('?') {
        "query parameters must be passed separately"
    } else if path.contains('#') {
        "fragments are not allowed"
    } else {
        return Ok(());
    };
    Err(ClientError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_is_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("Delete".parse::<Method>().unwrap(), Method::Delete);
        assert_eq!(Method::Put.to_string(), "PUT");
    }

    #[test]
    fn test_unsupported_method_rejected() {
        let err = "PATCH".parse::<Method>().unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedMethod(ref m) if m == "PATCH"));
        assert!(Method::try_from(&http::Method::HEAD).is_err());
        assert_eq!(Method::try_from(&http::Method::POST).unwrap(), Method::Post);
    }

    #[test]
    fn test_query_value_render() {
        assert_eq!(QueryValue::from(true).render().as_deref(), Some("true"));
        assert_eq!(QueryValue::from(false).render().as_deref(), Some("false"));
        assert_eq!(QueryValue::from(42_i64).render().as_deref(), Some("42"));
        assert_eq!(QueryValue::from(None::<&str>).render(), None);
        assert_eq!(QueryValue::from(Some("x")).render().as_deref(), Some("x"));
    }

    #[test]
    fn test_builder_collects_params_and_payload() {
        let request = QrsRequest::post("/qrs/app/copy")
            .param("name", "Copy")
            .param("privileges", true)
            .json(&serde_json::json!({"id": 1}));
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.query_params().len(), 2);
        assert!(matches!(request.payload, Payload::Json(_)));
        assert!(request.error.is_none());
    }

    #[test]
    fn test_absolute_path_is_deferred_error() {
        let request = QrsRequest::get("https://elsewhere/qrs/app");
        assert!(matches!(request.error, Some(ClientError::InvalidPath { .. })));

        let request = QrsRequest::get("/qrs/app?filter=x");
        assert!(matches!(request.error, Some(ClientError::InvalidPath { .. })));
    }

    #[test]
    fn test_json_serialization_error_is_deferred() {
        use std::collections::HashMap;
        // non-string map keys cannot become JSON object keys
        let mut bad = HashMap::new();
        bad.insert((1, 2), "v");
        let request = QrsRequest::post("/qrs/x").json(&bad);
        assert!(matches!(request.error, Some(ClientError::Json(_))));
    }

    #[test]
    fn test_empty_text_payload_is_empty() {
        assert!(Payload::Text(String::new()).is_empty());
        assert!(!Payload::Binary(Bytes::from_static(b"x")).is_empty());
    }
}
