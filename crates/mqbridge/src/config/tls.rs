//! TLS settings of a broker connection.

use std::path::PathBuf;

use mqbridge_client::{TlsConfig, TlsVersion};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM bundle of trusted CAs (default: webpki roots).
    pub ca: Option<PathBuf>,
    /// PEM client certificate chain.
    pub identity: Option<PathBuf>,
    /// PEM private key for `identity`.
    pub private_key: Option<PathBuf>,
    pub private_key_password: Option<String>,
    /// Cipher suite names separated by `:`.
    pub cipher_suites: Option<String>,
    /// `default`, `1.2` or `1.3`.
    pub protocol_version: String,
    pub verify_server_certificate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca: None,
            identity: None,
            private_key: None,
            private_key_password: None,
            cipher_suites: None,
            protocol_version: "default".to_string(),
            verify_server_certificate: true,
        }
    }
}

impl TlsSettings {
    pub fn to_client(&self) -> Result<TlsConfig, String> {
        let protocol_version = self
            .protocol_version
            .parse::<TlsVersion>()
            .map_err(|e| e.to_string())?;
        let tls = TlsConfig {
            ca: self.ca.clone(),
            identity: self.identity.clone(),
            private_key: self.private_key.clone(),
            private_key_password: self.private_key_password.clone(),
            cipher_suites: self.cipher_suites.clone(),
            protocol_version,
            verify_server_certificate: self.verify_server_certificate,
        };
        tls.validate()?;
        Ok(tls)
    }
}
