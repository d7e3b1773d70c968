//! Per-group TLS material for QUIC channels.
//!
//! Each group endpoint generates its own self-signed certificate and
//! publishes the DER through the group's store scope. Dialers trust exactly
//! that certificate, so a channel can only be opened to the endpoint that
//! registered for the group.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{FlagcxError, Result};

pub(crate) const ALPN: &[u8] = b"flagcx/1";

/// Name every endpoint certificate is issued for and every dialer expects.
pub(crate) const SERVER_NAME: &str = "flagcx.local";

pub fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert_params = rcgen::CertificateParams::new(vec![SERVER_NAME.into()])
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;
    let key_pair = rcgen::KeyPair::generate().map_err(|e| FlagcxError::Tls(e.to_string()))?;
    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;

    Ok((cert_der, key_der))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(keep_alive: Duration, idle_timeout: Duration) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(keep_alive));
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(idle_timeout).map_err(|e| FlagcxError::Tls(e.to_string()))?,
    ));
    Ok(transport)
}

pub fn make_server_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    keep_alive: Duration,
) -> Result<quinn::ServerConfig> {
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| FlagcxError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;
    tls_config.alpn_protocols = vec![ALPN.to_vec()];

    let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls_config))
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;

    let mut server = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    server.transport_config(Arc::new(transport_config(keep_alive, keep_alive * 6)?));
    Ok(server)
}

/// Client config that accepts only `trusted`, the certificate the peer
/// published for this group.
pub fn make_client_config(
    trusted: CertificateDer<'static>,
    keep_alive: Duration,
) -> Result<quinn::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(trusted)
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;

    let mut tls_config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| FlagcxError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN.to_vec()];

    let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
        .map_err(|e| FlagcxError::Tls(e.to_string()))?;

    let mut client = quinn::ClientConfig::new(Arc::new(quic_config));
    client.transport_config(Arc::new(transport_config(keep_alive, keep_alive * 6)?));
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_cert() {
        let (cert, _key) = generate_self_signed_cert().unwrap();
        assert!(!cert.is_empty());
    }

    #[test]
    fn test_make_configs() {
        let (cert, key) = generate_self_signed_cert().unwrap();
        make_server_config(cert.clone(), key, Duration::from_secs(5)).unwrap();
        make_client_config(cert, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_client_rejects_garbage_anchor() {
        let garbage = CertificateDer::from(vec![0u8; 8]);
        assert!(make_client_config(garbage, Duration::from_secs(5)).is_err());
    }
}
