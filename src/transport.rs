//! Outbound transport factory for backend connections
//!
//! Builds pooled hyper clients tuned for reverse-proxy workloads: generous
//! per-host idle-connection limits, bounded dial times, TCP keepalive, and
//! HTTP/1.1 + HTTP/2 support. HTTPS targets can optionally skip certificate
//! verification for backends with private or self-signed certificates.

use crate::config::Config;
use hyper::body::Incoming;
use hyper::Uri;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pooled client used by every route proxy
pub type ProxyClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Stock per-host pool limits are too conservative for a proxy; connection
/// churn shows up as repeated TLS handshakes under load.
const MAX_IDLE_PER_HOST: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Builds per-route transports from one configuration snapshot
#[derive(Debug, Clone)]
pub struct TransportFactory {
    connect_timeout: Duration,
    skip_tls_verify: bool,
}

impl TransportFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            skip_tls_verify: config.skip_tls_verify,
        }
    }

    /// Build a pooled client for the given backend target. Each route gets
    /// its own client, so pools are never shared across routes.
    pub fn client(&self, target: &Uri) -> ProxyClient {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(self.connect_timeout));
        http.set_keepalive(Some(TCP_KEEPALIVE));

        let https = self.https_connector(http, target);

        Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(https)
    }

    /// TLS client configuration shared with the raw upgrade dial path
    pub fn tls_client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::new(self.build_tls_config(self.skip_tls_verify))
    }

    fn https_connector(&self, http: HttpConnector, target: &Uri) -> HttpsConnector<HttpConnector> {
        let skip_verify = self.skip_tls_verify && target.scheme_str() == Some("https");
        if skip_verify {
            debug!(target = %target, "Backend TLS verification disabled");
        }

        HttpsConnectorBuilder::new()
            .with_tls_config(self.build_tls_config(skip_verify))
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    }

    fn build_tls_config(&self, skip_verify: bool) -> rustls::ClientConfig {
        if skip_verify {
            return rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
        }

        match rustls_platform_roots() {
            Ok(config) => config,
            Err(e) => {
                // Building a transport must not fail; fall back to the
                // bundled webpki roots.
                warn!(error = %e, "Failed to load native root certificates, using bundled roots");
                rustls::ClientConfig::builder()
                    .with_root_certificates(webpki_root_store())
                    .with_no_client_auth()
            }
        }
    }
}

fn rustls_platform_roots() -> anyhow::Result<rustls::ClientConfig> {
    let mut store = rustls::RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    if result.certs.is_empty() {
        anyhow::bail!("no native root certificates found");
    }
    for cert in result.certs {
        let _ = store.add(cert);
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth())
}

fn webpki_root_store() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Verifier that accepts any backend certificate. Only installed when
/// `skip_tls_verify` is set for HTTPS backends.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(skip_verify: bool) -> Config {
        let mut config: Config = toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:8080"]

[oauth]
client_id = "id"
client_secret = "secret"
"#,
        )
        .unwrap();
        config.skip_tls_verify = skip_verify;
        config
    }

    #[test]
    fn test_factory_from_config() {
        let factory = TransportFactory::from_config(&test_config(false));
        assert_eq!(factory.connect_timeout, Duration::from_secs(30));
        assert!(!factory.skip_tls_verify);
    }

    #[test]
    fn test_client_builds_for_both_schemes() {
        let factory = TransportFactory::from_config(&test_config(true));
        let _ = factory.client(&"http://127.0.0.1:8080".parse::<Uri>().unwrap());
        let _ = factory.client(&"https://10.0.0.2:8443".parse::<Uri>().unwrap());
    }

    #[test]
    fn test_tls_config_with_skip_verify() {
        let factory = TransportFactory::from_config(&test_config(true));
        // Must not panic and must produce a usable config
        let _ = factory.tls_client_config();
    }
}
