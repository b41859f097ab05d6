#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Transport and authentication core for the Qlik Sense Repository Service (QRS)
//!
//! This crate provides a hyper-based client that:
//! - Authenticates with a client certificate, NTLM or Negotiate
//! - Signs every call with an `Xrfkey` anti-CSRF token, sent both as a query
//!   parameter and as the `X-Qlik-Xrfkey` header
//! - Follows redirects itself, re-signing each hop with the call's key and
//!   re-running the connection-level auth handshake
//! - Streams app uploads and downloads in fixed-size chunks
//! - Decompresses responses transparently (gzip, brotli, deflate)
//!
//! Remote errors are not errors here: a 4xx or 5xx comes back as a
//! [`QrsResponse`] for the caller to interpret.
//!
//! # Example
//!
//! ```ignore
//! use qlik_sense_http::{Credentials, QrsClient, QrsRequest};
//!
//! let client = QrsClient::builder()
//!     .host("qlik.example.com")
//!     .credentials(Credentials::network("CORP", "jdoe", password))
//!     .build()?;
//!
//! let about = client.execute(QrsRequest::get("/qrs/about")).await?;
//! if about.is_success() {
//!     let body: serde_json::Value = about.json().await?;
//! }
//! ```

pub mod auth;
mod builder;
mod client;
mod config;
mod credentials;
mod error;
mod layers;
pub mod redirect;
mod request;
mod response;
mod secret;
mod settings;
pub mod signer;
mod streaming;
pub mod tls;

pub use auth::{AuthStrategy, Negotiation, SecurityContext, platform_security_context};
pub use builder::QrsClientBuilder;
pub use client::{QrsClient, map_buffer_error};
pub use config::{
    ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_REDIRECTS, DEFAULT_QRS_PORT, DEFAULT_USER_AGENT,
    Scheme,
};
pub use credentials::{
    ClientCertificate, CredentialProvider, Credentials, CredentialsConfig, QlikUser,
    SERVICE_ACCOUNT_DIRECTORY, SERVICE_ACCOUNT_USER,
};
pub use error::{ClientError, ConfigError, ErrorKind};
pub use layers::{UserAgentLayer, UserAgentService};
pub use redirect::RedirectPolicy;
pub use request::{Method, Payload, QrsRequest, QueryParams, QueryValue};
pub use response::{BoxError, LimitedBody, QrsResponse, ResponseBody, read_body_limited};
pub use secret::Password;
pub use settings::{ENV_PREFIX, Settings};
pub use signer::{PreparedBody, PreparedRequest, RequestBody, RequestSigner, XrfKey};
pub use streaming::{DownloadReport, FileUpload, UploadProgress};
