use crate::auth::AuthStrategy;
use crate::builder::QrsClientBuilder;
use crate::error::ClientError;
use crate::redirect::{self, CookieJar, RedirectPolicy};
use crate::request::{Method, Payload, QrsRequest, QueryParams};
use crate::response::{QrsResponse, ResponseBody, drain};
use crate::signer::{PreparedBody, PreparedRequest, RequestBody, RequestSigner, XrfKey};
use crate::streaming::{DownloadReport, FileUpload, write_chunks};
use http::header::{AUTHORIZATION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tower::buffer::Buffer;
use tower::{Service, ServiceExt};
use tracing::Instrument;
use url::Url;

/// Type alias for the future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, ClientError>> + Send>>;

/// Buffered connection shared by all clones of a client.
pub type Connection = Buffer<Request<RequestBody>, ServiceFuture>;

/// Client for the Qlik Sense Repository Service.
///
/// Every call goes through [`execute`](Self::execute), which signs the request
/// with a fresh anti-CSRF key, runs the connection-level auth handshake and
/// follows redirects with that same key until a terminal response arrives.
/// Remote errors (4xx/5xx) are returned as responses, not as `Err`.
///
/// `QrsClient` is `Clone + Send + Sync`; clones share one connection pool and
/// calls on different clones may run concurrently. Within a call, hops are
/// strictly sequential.
///
/// # Example
///
/// ```ignore
/// let client = QrsClient::builder()
///     .host("qlik.example.com")
///     .credentials(Credentials::certificate("/etc/qlik/client.pem"))
///     .build()?;
///
/// let apps: serde_json::Value = client
///     .execute(QrsRequest::get("/qrs/app").param("filter", "published eq true"))
///     .await?
///     .json()
///     .await?;
/// ```
#[derive(Clone)]
pub struct QrsClient {
    pub(crate) connection: Connection,
    pub(crate) signer: Arc<RequestSigner>,
    pub(crate) strategy: AuthStrategy,
    pub(crate) redirect: RedirectPolicy,
    pub(crate) max_body_size: usize,
    pub(crate) chunk_size: usize,
    pub(crate) span: tracing::Span,
}

impl QrsClient {
    #[must_use]
    pub fn builder() -> QrsClientBuilder {
        QrsClientBuilder::new()
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        self.signer.base_url()
    }

    /// Send `request` and follow its redirect chain.
    ///
    /// # Errors
    /// Returns `ClientError::TooManyRedirects` when the chain exceeds the
    /// configured bound, any deferred request-building error, and transport,
    /// TLS, timeout or handshake errors unchanged. Nothing is retried.
    pub async fn execute(&self, request: QrsRequest) -> Result<QrsResponse, ClientError> {
        let key = XrfKey::generate();
        let prepared = self.signer.sign(request, &key)?;
        let span = tracing::debug_span!(
            parent: &self.span,
            "qrs_call",
            method = %prepared.method,
            path = %prepared.url.path(),
            xrfkey = %key,
        );
        self.dispatch(prepared).instrument(span).await
    }

    /// Like [`execute`](Self::execute) with the method given by name.
    ///
    /// # Errors
    /// Returns `ClientError::UnsupportedMethod` before any I/O for verbs other
    /// than GET, POST, PUT and DELETE.
    pub async fn call(
        &self,
        method: &str,
        path: &str,
        params: QueryParams,
        payload: Payload,
    ) -> Result<QrsResponse, ClientError> {
        let method: Method = method.parse()?;
        let mut request = QrsRequest::new(method, path).params(params);
        request.payload = payload;
        self.execute(request).await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn get(&self, path: &str, params: QueryParams) -> Result<QrsResponse, ClientError> {
        self.execute(QrsRequest::get(path).params(params)).await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn post(
        &self,
        path: &str,
        params: QueryParams,
        payload: Payload,
    ) -> Result<QrsResponse, ClientError> {
        self.call("POST", path, params, payload).await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn put(
        &self,
        path: &str,
        params: QueryParams,
        payload: Payload,
    ) -> Result<QrsResponse, ClientError> {
        self.call("PUT", path, params, payload).await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn delete(&self, path: &str, params: QueryParams) -> Result<QrsResponse, ClientError> {
        self.execute(QrsRequest::delete(path).params(params)).await
    }

    /// POST a local file as an app upload, streamed in `chunk_size` chunks.
    ///
    /// The body cannot be replayed, so a 307/308 redirect of the upload fails
    /// with `ClientError::NonReplayableBody`.
    ///
    /// # Errors
    /// Returns `ClientError::Io` if the file cannot be read, and any error of
    /// [`execute`](Self::execute).
    pub async fn upload(
        &self,
        path: &str,
        file: impl AsRef<Path>,
        params: QueryParams,
    ) -> Result<QrsResponse, ClientError> {
        let upload = FileUpload::open(file, self.chunk_size).await?;
        self.execute(QrsRequest::post(path).params(params).upload(upload))
            .await
    }

    /// GET `path` and stream the body into `destination` in `chunk_size` blocks.
    ///
    /// Nothing is written for a non-success status. If the transfer breaks
    /// off, the partial file stays on disk.
    ///
    /// # Errors
    /// Returns `ClientError::Io` for file errors, `ClientError::Transport` if
    /// the body fails mid-transfer, and any error of [`execute`](Self::execute).
    pub async fn download(
        &self,
        path: &str,
        destination: impl AsRef<Path>,
        params: QueryParams,
    ) -> Result<DownloadReport, ClientError> {
        let destination = destination.as_ref().to_path_buf();
        let response = self.get(path, params).await?;
        let (parts, body) = response.into_inner().into_parts();

        if !parts.status.is_success() {
            tracing::debug!(status = parts.status.as_u16(), path, "download not written");
            drain(body, self.max_body_size).await;
            return Ok(DownloadReport {
                status: parts.status,
                headers: parts.headers,
                bytes_written: 0,
                destination,
            });
        }

        let bytes_written = write_chunks(body, &destination, self.chunk_size).await?;
        Ok(DownloadReport {
            status: parts.status,
            headers: parts.headers,
            bytes_written,
            destination,
        })
    }

    /// Redirect loop: one hop per iteration, original headers and key on every hop.
    async fn dispatch(&self, prepared: PreparedRequest) -> Result<QrsResponse, ClientError> {
        let PreparedRequest {
            mut method,
            mut url,
            headers,
            query,
            mut body,
            ..
        } = prepared;
        let mut jar = CookieJar::new();
        let mut redirects = 0usize;

        loop {
            let replay = body.try_clone();
            let response = self.send_hop(method, &url, &headers, body, &mut jar).await?;
            let status = response.status();

            if !redirect::is_redirect(status, response.headers()) {
                tracing::debug!(status = status.as_u16(), redirects, "call complete");
                return Ok(QrsResponse {
                    inner: response,
                    url,
                    redirects,
                    max_body_size: self.max_body_size,
                });
            }

            redirects += 1;
            self.redirect.check(redirects)?;

            let mut target = redirect::redirect_target(&url, response.headers())?;
            redirect::merge_query(&mut target, &query)?;
            let (next_method, keep_body) = redirect::redirect_method(status, method);
            body = if keep_body {
                replay.ok_or(ClientError::NonReplayableBody("a method-preserving redirect"))?
            } else {
                PreparedBody::Empty
            };

            redirect::log_hop(&url, &target, status, redirects);
            drain(response.into_body(), self.max_body_size).await;
            method = next_method;
            url = target;
        }
    }

    /// One hop, including the connection-level auth handshake if any.
    ///
    /// The probe leg carries the body when it can be replayed; streamed
    /// bodies only go out on the final leg. A probe the server accepts is
    /// never sent again, so a streamed body it did not carry is an error.
    async fn send_hop(
        &self,
        method: Method,
        url: &Url,
        headers: &HeaderMap,
        body: PreparedBody,
        jar: &mut CookieJar,
    ) -> Result<Response<ResponseBody>, ClientError> {
        let Some(mut handshake) = self.strategy.handshake(url)? else {
            return self.send(method, url, headers, body, None, jar).await;
        };

        let initial = handshake.initial()?;
        let probe_body = body.try_clone();
        let carried = probe_body.is_some();
        let probe = self
            .send(
                method,
                url,
                headers,
                probe_body.unwrap_or(PreparedBody::Empty),
                initial,
                jar,
            )
            .await?;

        if probe.status() != StatusCode::UNAUTHORIZED {
            if carried {
                return Ok(probe);
            }
            tracing::warn!(
                scheme = handshake.scheme(),
                status = %probe.status(),
                "server accepted the authentication probe before the streamed body was sent"
            );
            drain(probe.into_body(), self.max_body_size).await;
            return Err(ClientError::NonReplayableBody("an accepted authentication probe"));
        }

        match handshake.respond(probe.headers())? {
            Some(authorization) => {
                tracing::trace!(scheme = handshake.scheme(), "answering challenge");
                drain(probe.into_body(), self.max_body_size).await;
                self.send(method, url, headers, body, Some(authorization), jar)
                    .await
            }
            None => {
                tracing::debug!(scheme = handshake.scheme(), "authentication rejected");
                Ok(probe)
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: &HeaderMap,
        body: PreparedBody,
        authorization: Option<HeaderValue>,
        jar: &mut CookieJar,
    ) -> Result<Response<ResponseBody>, ClientError> {
        let len = body.len();
        let mut request = Request::builder()
            .method(method.to_http())
            .uri(url.as_str())
            .body(body.into_request_body())?;

        let request_headers = request.headers_mut();
        request_headers.clone_from(headers);
        if len > 0 {
            request_headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        if let Some(authorization) = authorization {
            request_headers.insert(AUTHORIZATION, authorization);
        }
        jar.apply(url, request_headers);

        tracing::trace!(method = %method, url = %url, body_len = len, "sending");

        let mut service = self.connection.clone();
        let response = service
            .ready()
            .await
            .map_err(map_buffer_error)?
            .call(request)
            .await
            .map_err(map_buffer_error)?;

        jar.absorb(url, response.headers());
        Ok(response)
    }
}

impl std::fmt::Debug for QrsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrsClient")
            .field("base_url", &self.signer.base_url().as_str())
            .field("strategy", &self.strategy)
            .field("redirect", &self.redirect)
            .finish_non_exhaustive()
    }
}

/// Map buffer errors to `ClientError`.
///
/// Errors from the inner service come back boxed and are unwrapped; anything
/// else means the buffer worker is gone.
pub fn map_buffer_error(err: tower::BoxError) -> ClientError {
    match err.downcast::<ClientError>() {
        Ok(client_err) => *client_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            ClientError::ServiceClosed
        }
    }
}
