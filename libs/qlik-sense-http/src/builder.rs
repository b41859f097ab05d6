use crate::auth::SecurityContext;
use crate::client::{Connection, QrsClient};
use crate::config::{ClientConfig, Scheme};
use crate::credentials::{CredentialProvider, Credentials, CredentialsConfig};
use crate::error::ClientError;
use crate::layers::UserAgentLayer;
use crate::redirect::RedirectPolicy;
use crate::response::{BoxError, ResponseBody};
use crate::signer::{RequestBody, RequestSigner};
use crate::tls;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Type-erased connection the middleware stack wraps.
pub type InnerService = BoxCloneService<Request<RequestBody>, Response<ResponseBody>, ClientError>;

/// Builder for [`QrsClient`].
///
/// Configuration and credential errors are collected while building and
/// reported by [`build`](Self::build), before any connection is made.
#[must_use]
pub struct QrsClientBuilder {
    config: ClientConfig,
    credentials: Option<Credentials>,
    security_context: Option<Arc<dyn SecurityContext>>,
    connection: Option<InnerService>,
    error: Option<ClientError>,
}

impl QrsClientBuilder {
    /// Builder with default configuration and ambient credentials.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            credentials: None,
            security_context: None,
            connection: None,
            error: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.config.scheme = scheme;
        self
    }

    /// Maximum redirects followed per call; `0` disables following.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// Timeout for each request attempt (each hop and handshake leg).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// PEM bundle of CAs trusted instead of the OS store.
    pub fn ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_bundle = Some(path.into());
        self
    }

    /// Set the buffer capacity for concurrent request handling
    ///
    /// Tower's Buffer panics with capacity=0, so we enforce minimum of 1.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Credentials from their flat settings form; conflicts surface in `build`.
    pub fn credentials_config(mut self, config: CredentialsConfig) -> Self {
        match Credentials::try_from(config) {
            Ok(credentials) => self.credentials = Some(credentials),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e.into());
                }
            }
        }
        self
    }

    /// Security context for ambient (Negotiate) authentication, replacing the
    /// platform one.
    pub fn security_context(mut self, context: Arc<dyn SecurityContext>) -> Self {
        self.security_context = Some(context);
        self
    }

    /// Replace the network connection with `service`.
    ///
    /// The middleware stack, signing and redirect handling still apply; only
    /// the innermost hyper client (and with it all TLS material loading) is
    /// skipped. Used to drive the client against in-process stubs.
    pub fn with_connection<S>(mut self, service: S) -> Self
    where
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = ClientError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.connection = Some(BoxCloneService::new(service));
        self
    }

    /// Build the client.
    ///
    /// Must be called within a Tokio runtime: the connection buffer spawns its
    /// worker task here.
    ///
    /// # Errors
    /// Returns `ClientError::Config` for invalid settings, conflicting or
    /// incomplete credentials, ambient credentials without a security context
    /// and unreadable TLS material, and
    /// `ClientError::InvalidHeaderValue` for an unusable user agent or identity.
    pub fn build(self) -> Result<QrsClient, ClientError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.config.validate()?;
        let base_url = self.config.base_url()?;

        let mut provider =
            CredentialProvider::new(self.credentials.unwrap_or(Credentials::Ambient))?;
        if let Some(context) = self.security_context {
            provider = provider.with_security_context(context);
        }
        let strategy = provider.auth_strategy()?;

        let inner = match self.connection {
            Some(connection) => connection,
            None => build_hyper_service(&self.config, &provider)?,
        };

        let timeout = self.config.request_timeout;
        let ua_layer = UserAgentLayer::try_new(&self.config.user_agent)?;

        // Request flow (outer → inner):
        //   Buffer → ErrorMapping → Timeout → UserAgent → [Decompression → hyper_client]
        //
        // Redirects and auth handshakes are driven by QrsClient above the
        // buffer, so every hop and handshake leg is one timed attempt.
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(ua_layer)
            .service(inner);
        let service = service.map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        let connection: Connection =
            Buffer::new(service.boxed_clone(), self.config.buffer_capacity.max(1));

        let span = tracing::info_span!(
            "qrs_client",
            host = %self.config.host,
            port = self.config.port,
            auth = provider.scheme_name(),
        );
        let signer = RequestSigner::new(base_url, &provider)?;
        tracing::debug!(parent: &span, base_url = %signer.base_url(), "client ready");

        Ok(QrsClient {
            connection,
            strategy,
            signer: Arc::new(signer),
            redirect: RedirectPolicy::new(self.config.max_redirects),
            max_body_size: self.config.max_body_size,
            chunk_size: self.config.chunk_size,
            span,
        })
    }
}

impl Default for QrsClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// hyper client over rustls, HTTP/1.1 only, with transparent decompression.
fn build_hyper_service(
    config: &ClientConfig,
    provider: &CredentialProvider,
) -> Result<InnerService, ClientError> {
    let tls_config = tls::client_config(provider, config.ca_bundle.as_deref())?;
    // Plain HTTP stays reachable so a redirect off TLS is followed (and warned about).
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    // pool_timer is required for pool_idle_timeout to take effect
    let mut client_builder = Client::builder(TokioExecutor::new());
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(config.pool_max_idle_per_host);
    if let Some(idle_timeout) = config.pool_idle_timeout {
        client_builder.pool_idle_timeout(idle_timeout);
    }
    let hyper_client = client_builder.build::<_, RequestBody>(https);

    let service = ServiceBuilder::new()
        .layer(DecompressionLayer::new())
        .service(hyper_client)
        .map_response(map_decompression_response)
        .map_err(ClientError::from);
    Ok(service.boxed_clone())
}

/// Map tower errors to `ClientError` with the actual timeout duration.
///
/// A `ClientError` boxed by a layer is unwrapped rather than wrapped again.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> ClientError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return ClientError::Timeout(timeout);
    }

    match err.downcast::<ClientError>() {
        Ok(client_err) => *client_err,
        Err(other) => ClientError::Transport(other),
    }
}

/// Box the decompression body into [`ResponseBody`].
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}
