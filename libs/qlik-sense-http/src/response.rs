use crate::error::ClientError;
use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderMap, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use url::Url;

/// Boxed error carried by request and response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type alias for the boxed response body.
///
/// The body has already passed through the decompression layer, so it yields
/// decompressed bytes when the server sent gzip, br or deflate.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pin_project! {
    /// Body wrapper that enforces size limits during streaming.
    ///
    /// Created by [`QrsResponse::into_limited_body()`]. Tracks bytes read
    /// and returns [`ClientError::BodyTooLarge`] once the limit is exceeded.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = ClientError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(ClientError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ClientError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Terminal response of one logical call.
///
/// Every status comes back this way, including 4xx and 5xx: interpreting the
/// status is the caller's job. All buffered body reads enforce the client's
/// `max_body_size`.
#[derive(Debug)]
pub struct QrsResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) url: Url,
    pub(crate) redirects: usize,
    pub(crate) max_body_size: usize,
}

impl QrsResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// URL of the hop that produced this response, query string included.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Redirects followed to reach this response.
    #[must_use]
    pub fn redirect_count(&self) -> usize {
        self.redirects
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.inner.status().is_success()
    }

    /// Whether this is a redirect the transport core follows (3xx with `Location`).
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        crate::redirect::is_redirect(self.inner.status(), self.inner.headers())
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.inner.headers().get(LOCATION)?.to_str().ok()
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Read the whole body. No status check.
    ///
    /// # Errors
    /// Returns `ClientError::BodyTooLarge` if the body exceeds the limit.
    pub async fn bytes(self) -> Result<Bytes, ClientError> {
        read_body_limited(self.inner, self.max_body_size).await
    }

    /// Read the body as UTF-8, replacing invalid sequences.
    ///
    /// # Errors
    /// Returns `ClientError::BodyTooLarge` if the body exceeds the limit.
    pub async fn text(self) -> Result<String, ClientError> {
        let body = read_body_limited(self.inner, self.max_body_size).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Parse the body as JSON. No status check.
    ///
    /// # Errors
    /// Returns `ClientError::BodyTooLarge` or `ClientError::Json`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let body = read_body_limited(self.inner, self.max_body_size).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Next non-empty data chunk of the body, `None` at the end.
    ///
    /// Chunks are yielded as received and are not subject to `max_body_size`.
    ///
    /// # Errors
    /// Returns `ClientError::Transport` if the body stream fails.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        while let Some(frame) = self.inner.body_mut().frame().await {
            let frame = frame.map_err(ClientError::Transport)?;
            if let Ok(data) = frame.into_data()
                && !data.is_empty()
            {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// The raw body stream, without a size limit.
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.inner.into_body()
    }

    /// The body stream, failing once more than `max_body_size` bytes arrive.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }
}

/// Collect a response body, failing once `limit` bytes are exceeded.
///
/// # Errors
/// Returns `ClientError::BodyTooLarge` or `ClientError::Transport`.
pub async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, ClientError> {
    let (_parts, body) = response.into_parts();

    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ClientError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(ClientError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Read and discard a body so the connection can be reused.
///
/// Stops quietly after `limit` bytes or on a body error; the connection is then
/// simply not reused.
pub(crate) async fn drain(body: ResponseBody, limit: usize) {
    let mut body = std::pin::pin!(body);
    let mut seen = 0usize;
    while let Some(Ok(frame)) = body.frame().await {
        if let Some(chunk) = frame.data_ref() {
            seen += chunk.len();
            if seen > limit {
                tracing::trace!(limit, "stopped draining oversized body");
                return;
            }
        }
    }
}
