//! Redirect-following rules for one logical call.
//!
//! The transport core follows every 3xx response that carries a `Location`,
//! re-sending the call's original signed headers (same anti-CSRF key) to the
//! new target with the original query parameters merged over the target's.
//! A per-call [`CookieJar`] carries cookies set along the chain.

use crate::error::ClientError;
use crate::request::Method;
use http::header::{COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::collections::BTreeMap;
use url::Url;

/// Whether `status` + `headers` form a redirect the core follows.
#[must_use]
pub fn is_redirect(status: StatusCode, headers: &HeaderMap) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) && headers.contains_key(LOCATION)
}

/// Bound on redirects per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPolicy {
    max_redirects: usize,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(max_redirects: usize) -> Self {
        Self { max_redirects }
    }

    #[must_use]
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Check that following redirect number `hops` (1-based) is allowed.
    ///
    /// # Errors
    /// Returns `ClientError::TooManyRedirects` once `hops` exceeds the bound.
    pub fn check(&self, hops: usize) -> Result<(), ClientError> {
        if hops > self.max_redirects {
            return Err(ClientError::TooManyRedirects {
                max: self.max_redirects,
            });
        }
        Ok(())
    }
}

/// Resolve the `Location` of a redirect response against the current URL.
///
/// # Errors
/// Returns `ClientError::InvalidRedirect` for a missing, non-UTF-8 or
/// unresolvable location, or one with a scheme other than http(s).
pub fn redirect_target(current: &Url, headers: &HeaderMap) -> Result<Url, ClientError> {
    let location = headers
        .get(LOCATION)
        .ok_or_else(|| ClientError::InvalidRedirect("missing Location header".to_owned()))?
        .to_str()
        .map_err(|_| ClientError::InvalidRedirect("Location is not valid UTF-8".to_owned()))?;

    let mut target = current
        .join(location)
        .map_err(|e| ClientError::InvalidRedirect(format!("'{location}': {e}")))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(ClientError::InvalidRedirect(format!(
            "unsupported scheme in '{location}'"
        )));
    }
    target.set_fragment(None);
    Ok(target)
}

/// Overlay the call's original query pairs on the target's query.
///
/// Keys present in both take the original value, in the target's position;
/// original keys the target lacks are appended. Repeated target keys collapse
/// to their last value.
///
/// # Errors
/// Returns `ClientError::InvalidRedirect` if the target query cannot be parsed.
pub fn merge_query(target: &mut Url, original: &[(String, String)]) -> Result<(), ClientError> {
    let existing: Vec<(String, String)> = match target.query() {
        Some(query) => serde_urlencoded::from_str(query)
            .map_err(|e| ClientError::InvalidRedirect(format!("unparsable query: {e}")))?,
        None => Vec::new(),
    };

    let mut merged: Vec<(String, String)> = Vec::with_capacity(existing.len() + original.len());
    for (name, value) in existing.into_iter().chain(original.iter().cloned()) {
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => merged.push((name, value)),
        }
    }

    let encoded = serde_urlencoded::to_string(&merged)
        .map_err(|e| ClientError::InvalidRedirect(format!("unencodable query: {e}")))?;
    target.set_query((!encoded.is_empty()).then_some(encoded.as_str()));
    Ok(())
}

/// Method and body handling for the next hop.
///
/// Returns the method to use and whether the body is re-sent: 303 always
/// becomes a body-less GET, 301/302 do so for anything but GET, and 307/308
/// keep both.
#[must_use]
pub fn redirect_method(status: StatusCode, method: Method) -> (Method, bool) {
    match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => (method, true),
        _ => (Method::Get, false),
    }
}

/// Debug-log the hop; warn when it leaves TLS.
pub(crate) fn log_hop(from: &Url, to: &Url, status: StatusCode, hop: usize) {
    tracing::debug!(
        status = status.as_u16(),
        from = %from,
        to = %to,
        hop,
        "following redirect"
    );
    if from.scheme() == "https" && to.scheme() == "http" {
        tracing::warn!(
            from = %from.origin().ascii_serialization(),
            to = %to.origin().ascii_serialization(),
            "redirect downgrades from HTTPS to plain HTTP"
        );
    }
}

/// Cookies collected during one call, keyed by host.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: BTreeMap<(String, String), String>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Record every `Set-Cookie` of a response from `origin`.
    ///
    /// Only the name and value are kept; attributes are ignored. An empty
    /// value removes the cookie.
    pub fn absorb(&mut self, origin: &Url, headers: &HeaderMap) {
        let host = origin.host_str().unwrap_or_default();
        for value in headers.get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let pair = value.split(';').next().unwrap_or_default();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let key = (host.to_owned(), name.to_owned());
            let value = value.trim();
            if value.is_empty() {
                self.cookies.remove(&key);
            } else {
                self.cookies.insert(key, value.to_owned());
            }
        }
    }

    /// `Cookie` header value for a request to `target`, if any cookie applies.
    #[must_use]
    pub fn header_value(&self, target: &Url) -> Option<HeaderValue> {
        let host = target.host_str().unwrap_or_default();
        let joined = self
            .cookies
            .iter()
            .filter(|((h, _), _)| h == host)
            .map(|((_, name), value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            return None;
        }
        let mut value = HeaderValue::try_from(joined).ok()?;
        value.set_sensitive(true);
        Some(value)
    }

    /// Set or clear the `Cookie` header on `headers` for `target`.
    pub fn apply(&self, target: &Url, headers: &mut HeaderMap) {
        match self.header_value(target) {
            Some(value) => {
                headers.insert(COOKIE, value);
            }
            None => {
                headers.remove(COOKIE);
            }
        }
    }
}
