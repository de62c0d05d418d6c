//! TLS configuration for pooled connections
//!
//! User-facing [`TlsOptions`] are shared across the whole client; each
//! pool that speaks TLS clones them, rewrites the target host to the
//! key's `ssl_host` (the key always wins) and pins ALPN to `http/1.1`,
//! then freezes the result into a `rustls::ClientConfig` for its
//! lifetime.

use std::io::Cursor;
use std::sync::Arc;

use courier_common::{CourierError, CourierResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Where the trust anchors come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootStoreSource {
    /// Bundled Mozilla roots (`webpki-roots`)
    #[default]
    WebPki,
    /// The platform certificate store
    Native,
    /// Only the explicitly supplied extra roots
    None,
}

/// TLS configuration, cloned and specialized per pool.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Trust anchor source
    pub root_store: RootStoreSource,
    /// Additional trust anchors appended to the root store
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Skip certificate verification (DANGEROUS - only for testing)
    pub danger_accept_invalid_certs: bool,
    /// SNI/validation name override. The pool rewrites this with the
    /// endpoint key's `ssl_host`; it is only honored for connections
    /// established through the connect callback.
    pub target_host: Option<String>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append trust anchors from PEM data. Returns how many certificates
    /// were added.
    pub fn add_root_pem(&mut self, pem: &[u8]) -> CourierResult<usize> {
        let mut reader = Cursor::new(pem);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                CourierError::invalid_request(format!("failed to parse PEM root: {e}"))
            })?;
            self.extra_roots.push(cert);
            added += 1;
        }
        Ok(added)
    }

    /// Clone these options for a pool whose key carries `ssl_host`.
    pub(crate) fn specialize(&self, ssl_host: &str) -> TlsOptions {
        let mut opts = self.clone();
        opts.target_host = Some(ssl_host.to_string());
        opts
    }
}

/// Build the frozen per-pool `rustls` configuration.
pub(crate) fn build_client_config(opts: &TlsOptions) -> CourierResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    match opts.root_store {
        RootStoreSource::WebPki => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        RootStoreSource::Native => {
            let native = rustls_native_certs::load_native_certs().map_err(|e| {
                CourierError::TlsHandshake {
                    host: "<roots>".to_string(),
                    message: format!("failed to load native roots: {e}"),
                    source: None,
                }
            })?;
            for cert in native {
                // Individual stores can carry stale or malformed entries
                if roots.add(cert).is_err() {
                    warn!("skipping unparseable native root certificate");
                }
            }
        }
        RootStoreSource::None => {}
    }

    for cert in &opts.extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| CourierError::TlsHandshake {
                host: "<roots>".to_string(),
                message: format!("failed to add extra root: {e}"),
                source: None,
            })?;
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    // Pooled connections are HTTP/1.1 only
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    if opts.danger_accept_invalid_certs {
        warn!("TLS certificate verification disabled - DANGEROUS!");
        config.dangerous().set_certificate_verifier(Arc::new(NoVerifier(
            rustls::crypto::aws_lc_rs::default_provider(),
        )));
    }

    Ok(Arc::new(config))
}

/// Resolve the SNI/validation name for a handshake.
pub(crate) fn server_name(host: &str) -> CourierResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| CourierError::TlsHandshake {
        host: host.to_string(),
        message: "invalid DNS name".to_string(),
        source: None,
    })
}

/// Verifier that accepts any server certificate.
///
/// Signature checks still run against the provider's algorithms so a
/// garbage handshake is rejected even in this mode.
#[derive(Debug)]
struct NoVerifier(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for NoVerifier {
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specialize_overrides_target_host() {
        let mut opts = TlsOptions::new();
        opts.target_host = Some("configured.example".to_string());

        let specialized = opts.specialize("real.example");
        assert_eq!(specialized.target_host.as_deref(), Some("real.example"));
        // The shared options are untouched
        assert_eq!(opts.target_host.as_deref(), Some("configured.example"));
    }

    #[test]
    fn test_build_config_pins_http1_alpn() {
        let config = build_client_config(&TlsOptions::new()).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_HTTP11.to_vec()]);
    }

    #[test]
    fn test_server_name_rejects_garbage() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("bad host name").is_err());
    }

    #[test]
    fn test_add_root_pem_rejects_junk() {
        let mut opts = TlsOptions::new();
        assert_eq!(opts.add_root_pem(b"not a certificate").unwrap(), 0);
    }
}
