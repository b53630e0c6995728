//! Flat `key = value` property configuration.
//!
//! Keys live under `client.`, `client.ssl.`, `subscription.` and
//! `publication.`. Values use a lenient grammar: booleans accept
//! `t/true/y/yes/1` and `f/false/n/no/0` in lower, upper or title case,
//! lists are `;`-separated, and durations are `<key>.sec` / `<key>.nanosec`
//! pairs. Unknown keys are ignored.

use std::path::PathBuf;

use ahash::AHashMap;
use mqbridge_core::{QoS, Time};

use crate::config::{
    is_tls_uri, ClientConfig, PersistenceLevel, ProtocolVersion, PublicationConfig,
    SubscriptionConfig, TlsConfig, TlsVersion,
};
use crate::error::{ClientError, Result};

pub const CLIENT_ID: &str = "client.id";
pub const CLIENT_PROTOCOL_VERSION: &str = "client.protocol_version";
pub const CLIENT_SERVERS: &str = "client.servers";
pub const CLIENT_CONNECTION_TIMEOUT: &str = "client.connection_timeout";
pub const CLIENT_MAX_CONNECTION_RETRIES: &str = "client.max_connection_retries";
pub const CLIENT_KEEP_ALIVE_PERIOD: &str = "client.keep_alive_period";
pub const CLIENT_CLEAN_SESSION: &str = "client.clean_session";
pub const CLIENT_UNSUBSCRIBE_ON_DISCONNECT: &str = "client.unsubscribe_on_disconnect";
pub const CLIENT_MAX_REPLY_TIMEOUT: &str = "client.max_reply_timeout";
pub const CLIENT_RECONNECT: &str = "client.reconnect";
pub const CLIENT_MAX_UNACK_MESSAGES: &str = "client.max_unack_messages";
pub const CLIENT_PERSISTENCE: &str = "client.persistence";
pub const CLIENT_PERSISTENCE_STORAGE: &str = "client.persistence_storage";
pub const CLIENT_USERNAME: &str = "client.username";
pub const CLIENT_PASSWORD: &str = "client.password";

pub const SSL_CA: &str = "client.ssl.ca";
pub const SSL_IDENTITY: &str = "client.ssl.id";
pub const SSL_PRIVATE_KEY: &str = "client.ssl.key";
pub const SSL_PRIVATE_KEY_PASSWORD: &str = "client.ssl.key_password";
pub const SSL_CIPHER_SUITES: &str = "client.ssl.cypher_suites";
pub const SSL_PROTOCOL_VERSION: &str = "client.ssl.protocol_version";
pub const SSL_VERIFY_SERVER_CERTIFICATE: &str = "client.ssl.verify_server_certificate";

pub const SUBSCRIPTION_TOPICS: &str = "subscription.topics";
pub const SUBSCRIPTION_MAX_QOS: &str = "subscription.max_qos";
pub const SUBSCRIPTION_QUEUE_SIZE: &str = "subscription.queue_size";

pub const PUBLICATION_TOPIC: &str = "publication.topic";
pub const PUBLICATION_QOS: &str = "publication.qos";
pub const PUBLICATION_RETAINED: &str = "publication.retained";
pub const PUBLICATION_USE_MESSAGE_INFO: &str = "publication.use_message_info";
pub const PUBLICATION_MAX_WAIT_TIME: &str = "publication.max_wait_time";

/// Older spelling of [`SSL_CIPHER_SUITES`].
const SSL_CIPHER_SUITES_LEGACY: &str = "client.ssl.cypher suites";

/// Parse a boolean in the lenient grammar.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "t" | "T" | "true" | "TRUE" | "True" | "y" | "Y" | "yes" | "YES" | "Yes" | "1" => Ok(true),
        "f" | "F" | "false" | "FALSE" | "False" | "n" | "N" | "no" | "NO" | "No" | "0" => {
            Ok(false)
        }
        other => Err(ClientError::InvalidConfig(format!(
            "invalid boolean '{}'",
            other
        ))),
    }
}

/// Split a `;`-separated list, trimming entries and skipping empty ones.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A flat property set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: AHashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a `key=value` assignment, as given on a command line.
    pub fn set_assignment(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ClientError::InvalidConfig(format!("expected key=value, got '{}'", assignment))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ClientError::InvalidConfig(format!(
                "empty key in '{}'",
                assignment
            )));
        }
        self.set(key, value.trim());
        Ok(())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn boolean(&self, key: &str) -> Result<Option<bool>> {
        self.get(key).map(parse_bool).transpose()
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|v| {
                v.trim().parse::<T>().map_err(|e| {
                    ClientError::InvalidConfig(format!("invalid value for {}: {}", key, e))
                })
            })
            .transpose()
    }

    /// Read `<key>.sec` / `<key>.nanosec`. Either half may be omitted.
    fn time(&self, key: &str) -> Result<Option<Time>> {
        let sec = self.parsed::<i64>(&format!("{}.sec", key))?;
        let nanosec = self.parsed::<i64>(&format!("{}.nanosec", key))?;
        if sec.is_none() && nanosec.is_none() {
            return Ok(None);
        }
        Ok(Some(Time::new(sec.unwrap_or(0), nanosec.unwrap_or(0))))
    }

    /// Apply `client.*` properties on top of `base`.
    pub fn client_config(&self, base: ClientConfig) -> Result<ClientConfig> {
        let mut config = base;

        if let Some(id) = self.string(CLIENT_ID) {
            config.id = id;
        }
        if let Some(version) = self.parsed::<ProtocolVersion>(CLIENT_PROTOCOL_VERSION)? {
            config.protocol_version = version;
        }
        if let Some(servers) = self.get(CLIENT_SERVERS) {
            config.server_uris = parse_list(servers);
        }
        if let Some(t) = self.time(CLIENT_CONNECTION_TIMEOUT)? {
            config.connect_timeout = t.to_duration()?;
        }
        if let Some(n) = self.parsed::<u32>(CLIENT_MAX_CONNECTION_RETRIES)? {
            config.max_connection_retries = n;
        }
        if let Some(t) = self.time(CLIENT_KEEP_ALIVE_PERIOD)? {
            config.keep_alive = t.to_duration()?;
        }
        if let Some(b) = self.boolean(CLIENT_CLEAN_SESSION)? {
            config.clean_session = b;
        }
        if let Some(b) = self.boolean(CLIENT_UNSUBSCRIBE_ON_DISCONNECT)? {
            config.unsubscribe_on_disconnect = b;
        }
        if let Some(t) = self.time(CLIENT_MAX_REPLY_TIMEOUT)? {
            config.max_reply_timeout = t.to_duration()?;
        }
        if let Some(b) = self.boolean(CLIENT_RECONNECT)? {
            config.reconnect = b;
        }
        if let Some(n) = self.parsed::<u16>(CLIENT_MAX_UNACK_MESSAGES)? {
            config.max_unack_messages = n;
        }
        if let Some(level) = self.parsed::<PersistenceLevel>(CLIENT_PERSISTENCE)? {
            config.persistence = level;
        }
        if let Some(path) = self.get(CLIENT_PERSISTENCE_STORAGE) {
            config.persistence_storage = Some(PathBuf::from(path));
        }
        if let Some(username) = self.string(CLIENT_USERNAME) {
            config.username = Some(username);
        }
        if let Some(password) = self.get(CLIENT_PASSWORD) {
            config.password = Some(password.as_bytes().to_vec());
        }

        config.tls = self.tls_config(config.tls.take(), &config.server_uris)?;
        Ok(config)
    }

    fn tls_config(
        &self,
        base: Option<TlsConfig>,
        server_uris: &[String],
    ) -> Result<Option<TlsConfig>> {
        let has_ssl_keys = self.values.keys().any(|k| k.starts_with("client.ssl."));
        let implied = server_uris.iter().any(|uri| is_tls_uri(uri));
        if base.is_none() && !has_ssl_keys && !implied {
            return Ok(None);
        }

        let mut tls = base.unwrap_or_default();
        if let Some(ca) = self.get(SSL_CA) {
            tls.ca = Some(PathBuf::from(ca));
        }
        if let Some(identity) = self.get(SSL_IDENTITY) {
            tls.identity = Some(PathBuf::from(identity));
        }
        if let Some(key) = self.get(SSL_PRIVATE_KEY) {
            tls.private_key = Some(PathBuf::from(key));
        }
        if let Some(password) = self.string(SSL_PRIVATE_KEY_PASSWORD) {
            tls.private_key_password = Some(password);
        }
        if let Some(suites) = self
            .string(SSL_CIPHER_SUITES)
            .or_else(|| self.string(SSL_CIPHER_SUITES_LEGACY))
        {
            tls.cipher_suites = Some(suites);
        }
        if let Some(version) = self.parsed::<TlsVersion>(SSL_PROTOCOL_VERSION)? {
            tls.protocol_version = version;
        }
        if let Some(verify) = self.boolean(SSL_VERIFY_SERVER_CERTIFICATE)? {
            tls.verify_server_certificate = verify;
        }
        Ok(Some(tls))
    }

    /// Apply `subscription.*` properties on top of `base`.
    pub fn subscription_config(&self, base: SubscriptionConfig) -> Result<SubscriptionConfig> {
        let mut config = base;
        if let Some(topics) = self.get(SUBSCRIPTION_TOPICS) {
            config.topics = parse_list(topics);
        }
        if let Some(qos) = self.parsed::<QoS>(SUBSCRIPTION_MAX_QOS)? {
            config.max_qos = qos;
        }
        if let Some(size) = self.parsed::<usize>(SUBSCRIPTION_QUEUE_SIZE)? {
            config.message_queue_size = size;
        }
        Ok(config)
    }

    /// Apply `publication.*` properties on top of `base`.
    pub fn publication_config(&self, base: PublicationConfig) -> Result<PublicationConfig> {
        let mut config = base;
        if let Some(topic) = self.string(PUBLICATION_TOPIC) {
            config.topic = topic;
        }
        if let Some(qos) = self.parsed::<QoS>(PUBLICATION_QOS)? {
            config.qos = qos;
        }
        if let Some(b) = self.boolean(PUBLICATION_RETAINED)? {
            config.retained = b;
        }
        if let Some(b) = self.boolean(PUBLICATION_USE_MESSAGE_INFO)? {
            config.use_message_info = b;
        }
        if let Some(t) = self.time(PUBLICATION_MAX_WAIT_TIME)? {
            config.max_wait_time = t.to_duration()?;
        }
        Ok(config)
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Properties::new();
        for (key, value) in iter {
            properties.set(key, value);
        }
        properties
    }
}
