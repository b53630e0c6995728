//! Broker connection configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use mqbridge_client::{
    ClientConfig, PersistenceLevel, Properties, ProtocolVersion, ReconnectBackoff,
};
use serde::Deserialize;

use super::tls::TlsSettings;

/// One `[[connection]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Name routes refer to.
    pub name: String,
    /// Broker URIs, tried in order.
    #[serde(default)]
    pub servers: Vec<String>,
    /// MQTT client id (default: `mqbridge-<name>`).
    #[serde(default)]
    pub client_id: Option<String>,
    /// `default`, `3.1`, `3.1.1` or `5`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Seconds to wait for the broker to accept a connection.
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,
    /// Seconds to wait for subscribe/unsubscribe/disconnect acknowledgements.
    #[serde(default = "default_timeout")]
    pub reply_timeout: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub unsubscribe_on_disconnect: bool,
    #[serde(default = "default_max_unack")]
    pub max_unack_messages: u16,

    // === Reconnection ===
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Reconnect attempts after a connection loss (0 = unlimited).
    #[serde(default = "default_max_retries")]
    pub max_connection_retries: u32,
    /// Initial reconnect delay in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Maximum reconnect delay in seconds (exponential backoff cap).
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: u64,

    /// `none` or `durable`.
    #[serde(default = "default_persistence")]
    pub persistence: String,
    #[serde(default)]
    pub persistence_storage: Option<PathBuf>,

    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Raw `client.*` properties, applied after everything above.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_protocol_version() -> String {
    "default".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_unack() -> u16 {
    10
}

fn default_max_retries() -> u32 {
    10
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    30
}

fn default_persistence() -> String {
    "none".to_string()
}

impl ConnectionConfig {
    /// A connection with defaults for everything but name and servers.
    #[allow(dead_code)]
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: vec![server.into()],
            client_id: None,
            protocol_version: default_protocol_version(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            connect_timeout: default_timeout(),
            reply_timeout: default_timeout(),
            clean_session: true,
            unsubscribe_on_disconnect: false,
            max_unack_messages: default_max_unack(),
            reconnect: true,
            max_connection_retries: default_max_retries(),
            reconnect_delay: default_reconnect_delay(),
            reconnect_max: default_reconnect_max(),
            persistence: default_persistence(),
            persistence_storage: None,
            tls: None,
            properties: BTreeMap::new(),
        }
    }

    /// Build the client configuration, including the raw properties.
    pub fn to_client_config(&self) -> Result<ClientConfig, String> {
        let context = |e: &dyn std::fmt::Display| format!("connection '{}': {}", self.name, e);

        let protocol_version = self
            .protocol_version
            .parse::<ProtocolVersion>()
            .map_err(|e| context(&e))?;
        let persistence = self
            .persistence
            .parse::<PersistenceLevel>()
            .map_err(|e| context(&e))?;

        let mut config = ClientConfig {
            id: self
                .client_id
                .clone()
                .unwrap_or_else(|| format!("mqbridge-{}", self.name)),
            protocol_version,
            server_uris: self.servers.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_connection_retries: self.max_connection_retries,
            keep_alive: Duration::from_secs(self.keep_alive),
            clean_session: self.clean_session,
            unsubscribe_on_disconnect: self.unsubscribe_on_disconnect,
            max_reply_timeout: Duration::from_secs(self.reply_timeout),
            reconnect: self.reconnect,
            reconnect_backoff: ReconnectBackoff {
                initial_delay: Duration::from_secs(self.reconnect_delay),
                max_delay: Duration::from_secs(self.reconnect_max.max(self.reconnect_delay)),
                ..Default::default()
            },
            max_unack_messages: self.max_unack_messages,
            persistence,
            persistence_storage: self.persistence_storage.clone(),
            username: self.username.clone(),
            password: self.password.as_ref().map(|p| p.as_bytes().to_vec()),
            tls: None,
        };
        if let Some(tls) = &self.tls {
            config.tls = Some(tls.to_client().map_err(|e| context(&e))?);
        }

        if !self.properties.is_empty() {
            let properties: Properties = self.properties.clone().into_iter().collect();
            config = properties.client_config(config).map_err(|e| context(&e))?;
        }

        config.validate().map_err(|e| context(&e))?;
        Ok(config)
    }

    /// Validate the connection configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("connection name must not be empty".into());
        }
        self.to_client_config().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::new("local", "tcp://localhost:1883")
            .to_client_config()
            .unwrap();
        assert_eq!(config.id, "mqbridge-local");
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.max_unack_messages, 10);
        assert!(config.reconnect);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_properties_override_fields() {
        let mut connection = ConnectionConfig::new("cloud", "tcp://a:1883");
        connection
            .properties
            .insert("client.servers".into(), "tcp://b:1883;tcp://c:1883".into());
        connection
            .properties
            .insert("client.keep_alive_period.sec".into(), "15".into());

        let config = connection.to_client_config().unwrap();
        assert_eq!(config.server_uris, vec!["tcp://b:1883", "tcp://c:1883"]);
        assert_eq!(config.keep_alive, Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_values() {
        let mut connection = ConnectionConfig::new("x", "tcp://a:1883");
        connection.protocol_version = "4".into();
        assert!(connection.validate().is_err());

        let mut connection = ConnectionConfig::new("x", "tcp://a:1883");
        connection.servers.clear();
        assert!(connection.validate().is_err());

        let connection = ConnectionConfig::new(" ", "tcp://a:1883");
        assert!(connection.validate().is_err());
    }
}
