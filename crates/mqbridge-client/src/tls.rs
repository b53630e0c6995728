//! TLS client configuration built from [`TlsConfig`] material.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use rumqttc::tokio_rustls::rustls;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};

use crate::config::{TlsConfig, TlsVersion};
use crate::error::{ClientError, Result};

/// Build a rustls client configuration.
pub fn build_client_config(config: &TlsConfig) -> Result<Arc<ClientConfig>> {
    config.validate().map_err(ClientError::InvalidConfig)?;

    let provider = CryptoProvider {
        cipher_suites: select_cipher_suites(config.cipher_suites.as_deref())?,
        ..ring::default_provider()
    };
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(protocol_versions(config.protocol_version)?)
        .map_err(|e| ClientError::Tls(format!("Unusable TLS settings: {}", e)))?;

    let builder = if config.verify_server_certificate {
        builder.with_root_certificates(load_roots(config.ca.as_deref())?)
    } else {
        warn!("TLS server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
    };

    let tls_config = match (&config.identity, &config.private_key) {
        (Some(cert_path), Some(key_path)) => {
            if config.private_key_password.is_some() {
                warn!("Private key password ignored; the key must be stored unencrypted");
            }
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("Failed to configure client auth: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(tls_config))
}

fn protocol_versions(version: TlsVersion) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match version {
        TlsVersion::Default => Ok(rustls::DEFAULT_VERSIONS),
        TlsVersion::Tls12 => Ok(TLS12),
        TlsVersion::Tls13 => Ok(TLS13),
        TlsVersion::Tls10 | TlsVersion::Tls11 => Err(ClientError::InvalidConfig(
            "TLS 1.0 and 1.1 are not supported".to_string(),
        )),
    }
}

/// Pick cipher suites by name (`TLS13_AES_128_GCM_SHA256`, ...), separated
/// by `:`, `,` or `;`. No list selects the provider defaults.
fn select_cipher_suites(names: Option<&str>) -> Result<Vec<SupportedCipherSuite>> {
    let all = ring::default_provider().cipher_suites;
    let Some(names) = names else {
        return Ok(all);
    };

    let mut selected = Vec::new();
    for name in names
        .split(|c| c == ':' || c == ',' || c == ';')
        .map(str::trim)
        .filter(|n| !n.is_empty())
    {
        let suite = all
            .iter()
            .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
            .ok_or_else(|| ClientError::InvalidConfig(format!("unknown cipher suite '{}'", name)))?;
        selected.push(*suite);
    }
    if selected.is_empty() {
        return Err(ClientError::InvalidConfig("empty cipher suite list".to_string()));
    }
    Ok(selected)
}

fn load_roots(ca: Option<&Path>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match ca {
        Some(path) => {
            for cert in load_certs(path)? {
                root_store
                    .add(cert)
                    .map_err(|e| ClientError::Tls(format!("Failed to add CA cert: {}", e)))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(root_store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ClientError::Tls(format!("Failed to open certificate {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ClientError::Tls(format!("Failed to parse certificate {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!("No certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ClientError::Tls(format!("Failed to open private key {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ClientError::Tls(format!("No private key found in {}", path.display())))
}

/// Accepts any server certificate.
mod danger {
    use super::rustls;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            super::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
