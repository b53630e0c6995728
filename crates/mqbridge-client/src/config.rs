//! Client, subscription and publication configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mqbridge_core::{CoreError, QoS};

use crate::error::{ClientError, Result};

/// MQTT protocol version requested from the library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Let the library pick (3.1.1 with fallback where supported).
    #[default]
    Default,
    Mqtt31,
    Mqtt311,
    Mqtt5,
}

impl FromStr for ProtocolVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" | "MQTT_DEFAULT" => Ok(ProtocolVersion::Default),
            "3.1" | "MQTT_3_1" => Ok(ProtocolVersion::Mqtt31),
            "3.1.1" | "MQTT_3_1_1" => Ok(ProtocolVersion::Mqtt311),
            "5" | "MQTT_5" => Ok(ProtocolVersion::Mqtt5),
            other => Err(CoreError::InvalidValue {
                what: "protocol version",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolVersion::Default => "default",
            ProtocolVersion::Mqtt31 => "3.1",
            ProtocolVersion::Mqtt311 => "3.1.1",
            ProtocolVersion::Mqtt5 => "5",
        })
    }
}

/// Whether in-flight session state survives the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceLevel {
    #[default]
    None,
    Durable,
}

impl FromStr for PersistenceLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" | "NONE" | "n" | "N" | "no" | "NO" | "No" | "0" => Ok(PersistenceLevel::None),
            "durable" | "DURABLE" | "Durable" | "y" | "Y" | "yes" | "YES" | "Yes" | "1" => {
                Ok(PersistenceLevel::Durable)
            }
            other => Err(CoreError::InvalidValue {
                what: "persistence",
                value: other.to_string(),
            }),
        }
    }
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    Default,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" | "TLS_DEFAULT" => Ok(TlsVersion::Default),
            "1.0" | "TLS_1_0" => Ok(TlsVersion::Tls10),
            "1.1" | "TLS_1_1" => Ok(TlsVersion::Tls11),
            "1.2" | "TLS_1_2" => Ok(TlsVersion::Tls12),
            "1.3" | "TLS_1_3" => Ok(TlsVersion::Tls13),
            other => Err(CoreError::InvalidValue {
                what: "TLS protocol version",
                value: other.to_string(),
            }),
        }
    }
}

/// TLS material for broker connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file with trusted CA certificates (webpki roots when unset).
    pub ca: Option<PathBuf>,
    /// PEM file with the client certificate chain.
    pub identity: Option<PathBuf>,
    /// PEM file with the client private key.
    pub private_key: Option<PathBuf>,
    pub private_key_password: Option<String>,
    /// Colon, comma or semicolon separated cipher suite names.
    pub cipher_suites: Option<String>,
    pub protocol_version: TlsVersion,
    pub verify_server_certificate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca: None,
            identity: None,
            private_key: None,
            private_key_password: None,
            cipher_suites: None,
            protocol_version: TlsVersion::Default,
            verify_server_certificate: true,
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.identity.is_some() != self.private_key.is_some() {
            return Err("TLS identity and private key must be configured together".into());
        }
        Ok(())
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectBackoff {
    /// Delay to use after `delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .map_or(self.max_delay, |next| next.min(self.max_delay))
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Client identifier.
    pub id: String,
    pub protocol_version: ProtocolVersion,
    /// Broker URIs, tried in order (`tcp://host:port`, `ssl://host:port`, ...).
    pub server_uris: Vec<String>,
    /// Bound on connect (zero = wait forever).
    pub connect_timeout: Duration,
    /// Reconnection attempts after a connection loss (0 = unlimited).
    pub max_connection_retries: u32,
    /// Keep-alive interval (zero disables keep-alive).
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Cancel broker-side subscriptions before disconnecting.
    pub unsubscribe_on_disconnect: bool,
    /// Bound on subscribe/unsubscribe/disconnect/publish replies (zero = wait forever).
    pub max_reply_timeout: Duration,
    /// Reconnect automatically after a connection loss.
    pub reconnect: bool,
    pub reconnect_backoff: ReconnectBackoff,
    /// Maximum in-flight QoS 1/2 messages.
    pub max_unack_messages: u16,
    pub persistence: PersistenceLevel,
    pub persistence_storage: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub tls: Option<TlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            protocol_version: ProtocolVersion::Default,
            server_uris: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            max_connection_retries: 10,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            unsubscribe_on_disconnect: false,
            max_reply_timeout: Duration::from_secs(10),
            reconnect: true,
            reconnect_backoff: ReconnectBackoff::default(),
            max_unack_messages: 10,
            persistence: PersistenceLevel::None,
            persistence_storage: None,
            username: None,
            password: None,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create a config for one broker URI.
    pub fn new(server_uri: impl Into<String>) -> Self {
        Self {
            server_uris: vec![server_uri.into()],
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Append a fallback broker URI.
    pub fn server(mut self, uri: impl Into<String>) -> Self {
        self.server_uris.push(uri.into());
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_reply_timeout(mut self, timeout: Duration) -> Self {
        self.max_reply_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn max_connection_retries(mut self, retries: u32) -> Self {
        self.max_connection_retries = retries;
        self
    }

    pub fn unsubscribe_on_disconnect(mut self, unsubscribe: bool) -> Self {
        self.unsubscribe_on_disconnect = unsubscribe;
        self
    }

    pub fn max_unack_messages(mut self, max: u16) -> Self {
        self.max_unack_messages = max;
        self
    }

    pub fn persistence(mut self, level: PersistenceLevel, storage: Option<PathBuf>) -> Self {
        self.persistence = level;
        self.persistence_storage = storage;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Whether TLS is configured or implied by a server URI scheme.
    pub fn uses_tls(&self) -> bool {
        self.tls.is_some() || self.server_uris.iter().any(|uri| is_tls_uri(uri))
    }

    /// Check for missing or contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if self.server_uris.is_empty() {
            return Err(ClientError::InvalidConfig("no server URIs configured".into()));
        }
        if let Some(uri) = self.server_uris.iter().find(|uri| uri.trim().is_empty()) {
            return Err(ClientError::InvalidConfig(format!("invalid server URI '{}'", uri)));
        }
        if self.id.is_empty() {
            return Err(ClientError::InvalidConfig("client id must not be empty".into()));
        }
        if self.max_unack_messages == 0 {
            return Err(ClientError::InvalidConfig(
                "max_unack_messages must be at least 1".into(),
            ));
        }
        let multiplier = self.reconnect_backoff.multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ClientError::InvalidConfig(
                "reconnect backoff multiplier must be >= 1".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            tls.validate().map_err(ClientError::InvalidConfig)?;
        }
        Ok(())
    }
}

pub(crate) fn is_tls_uri(uri: &str) -> bool {
    uri.starts_with("ssl://") || uri.starts_with("mqtts://")
}

/// Subscription configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Topic filters, submitted in order.
    pub topics: Vec<String>,
    /// Maximum QoS requested for every filter.
    pub max_qos: QoS,
    /// Receive queue capacity (0 = unbounded).
    pub message_queue_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            max_qos: QoS::AtMostOnce,
            message_queue_size: 0,
        }
    }
}

impl SubscriptionConfig {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn max_qos(mut self, qos: QoS) -> Self {
        self.max_qos = qos;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }
}

/// Publication configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublicationConfig {
    /// Fixed topic (ignored with `use_message_info`).
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
    /// Take topic, QoS and retained flag from each written message.
    pub use_message_info: bool,
    /// Bound on each write's acknowledgement (zero = client's max reply timeout).
    pub max_wait_time: Duration,
}

impl PublicationConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// A publication that forwards each message's own topic and attributes.
    pub fn from_message_info() -> Self {
        Self {
            use_message_info: true,
            ..Default::default()
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requires_server_and_id() {
        let config = ClientConfig::default();
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));

        let config = ClientConfig::new("tcp://localhost:1883");
        assert!(config.validate().is_err());

        let config = config.id("bridge-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_inflight_rejected() {
        let config = ClientConfig::new("tcp://localhost:1883")
            .id("c")
            .max_unack_messages(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_implied_by_scheme() {
        let config = ClientConfig::new("tcp://a:1883").id("c");
        assert!(!config.uses_tls());
        let config = config.server("ssl://b:8883");
        assert!(config.uses_tls());
    }

    #[test]
    fn test_tls_identity_requires_key() {
        let tls = TlsConfig {
            identity: Some(PathBuf::from("/etc/client.pem")),
            ..Default::default()
        };
        let config = ClientConfig::new("ssl://a:8883").id("c").tls(tls);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_version_parsing() {
        assert_eq!("3.1.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Mqtt311);
        assert_eq!("MQTT_5".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Mqtt5);
        assert_eq!("default".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Default);
        assert!("4".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_persistence_parsing() {
        assert_eq!("No".parse::<PersistenceLevel>().unwrap(), PersistenceLevel::None);
        assert_eq!("durable".parse::<PersistenceLevel>().unwrap(), PersistenceLevel::Durable);
        assert!("sometimes".parse::<PersistenceLevel>().is_err());
    }

    #[test]
    fn test_backoff_caps_delay() {
        let backoff = ReconnectBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };
        assert_eq!(backoff.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(Duration::from_secs(4)), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_multiplier_must_be_finite() {
        for multiplier in [0.5, f64::NAN, f64::INFINITY] {
            let config = ClientConfig::new("tcp://localhost:1883")
                .id("c")
                .reconnect_backoff(ReconnectBackoff {
                    multiplier,
                    ..Default::default()
                });
            assert!(
                matches!(config.validate(), Err(ClientError::InvalidConfig(_))),
                "multiplier {} accepted",
                multiplier
            );
        }
    }

    #[test]
    fn test_backoff_overflow_saturates() {
        let backoff = ReconnectBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: f64::MAX,
        };
        assert_eq!(backoff.next_delay(Duration::from_secs(10)), Duration::from_secs(30));
    }
}
