//! TLS configuration for the repository connection.
//!
//! Native root certificates are loaded once per process and cached. Client
//! certificates and CA bundles are read from PEM files at client construction
//! so that unusable material is a configuration error, not a late TLS failure.

use crate::credentials::{ClientCertificate, CredentialProvider};
use crate::error::{ClientError, ConfigError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Cached native root certificates; empty means none were found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// Native root certificates, loaded lazily on first call.
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// The globally installed crypto provider, or aws-lc-rs without installing it.
pub fn get_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn tls_material(path: &Path, reason: impl ToString) -> ConfigError {
    ConfigError::TlsMaterial {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_material(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_material(path, e))?;
    if certs.is_empty() {
        return Err(tls_material(path, "no certificates found"));
    }
    Ok(certs)
}

/// Read the client certificate chain and its private key.
///
/// # Errors
/// Returns `ConfigError::TlsMaterial` naming the file that is missing or unparsable.
pub fn load_client_identity(
    certificate: &ClientCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigError> {
    let chain = read_certificates(&certificate.cert_path)?;
    let key = PrivateKeyDer::from_pem_file(&certificate.key_path)
        .map_err(|e| tls_material(&certificate.key_path, e))?;
    Ok((chain, key))
}

fn root_store(ca_bundle: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let mut store = RootCertStore::empty();
    match ca_bundle {
        Some(path) => {
            let (added, ignored) = store.add_parsable_certificates(read_certificates(path)?);
            if added == 0 {
                return Err(tls_material(
                    path,
                    format!("none of the {ignored} certificates could be used as trust anchors"),
                ));
            }
        }
        None => {
            let (added, ignored) = store.add_parsable_certificates(native_root_certs().iter().cloned());
            if ignored > 0 {
                tracing::warn!(
                    added = added,
                    ignored = ignored,
                    "some native root certificates could not be parsed"
                );
            }
        }
    }
    Ok(store)
}

/// Build the rustls configuration for `provider`'s credentials.
///
/// - server verification against `ca_bundle` or the native store, or none
///   when the credentials disable it
/// - the client certificate and key for certificate credentials
/// - no ALPN list; the hyper-rustls connector advertises HTTP/1.1 itself
///
/// # Errors
/// Returns `ConfigError::TlsMaterial` for unreadable PEM files and
/// `ClientError::Tls` if rustls rejects the material.
pub fn client_config(
    provider: &CredentialProvider,
    ca_bundle: Option<&Path>,
) -> Result<rustls::ClientConfig, ClientError> {
    let crypto = get_crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(crypto.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(Box::new(e)))?;

    let builder = if provider.verify_server_certificate() {
        builder.with_root_certificates(root_store(ca_bundle)?)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { crypto }))
    };

    let config = match provider.client_certificate() {
        Some(certificate) => {
            let (chain, key) = load_client_identity(&certificate)?;
            tracing::debug!(
                certificate = %certificate.cert_path.display(),
                "presenting client certificate"
            );
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ClientError::Tls(Box::new(e)))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Trusts any server certificate while still checking handshake signatures.
///
/// Installed only when certificate credentials set `verify = false`, for
/// repository services presenting their self-signed Qlik CA certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    crypto: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}
