//! Relay configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `mqbridge.toml`)
//! - Environment variables with `MQBRIDGE__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//! - Command-line properties: `-p <connection>.<client property>=<value>`
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [[connection]]
//! name = "edge"
//! servers = ["tcp://${EDGE_HOST:-localhost}:1883"]
//!
//! [[connection]]
//! name = "cloud"
//! servers = ["mqtts://broker.example.com"]
//!
//! [[route]]
//! name = "telemetry"
//! from = "edge"
//! to = "cloud"
//! topics = ["sensors/#"]
//! max_qos = 1
//! prefix = "site-1/"
//! ```

mod connection;
mod log;
mod route;
mod tls;

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use connection::ConnectionConfig;
pub use self::log::LogConfig;
pub use route::RouteConfig;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub connection: Vec<ConnectionConfig>,
    pub route: Vec<RouteConfig>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides, then apply command-line `properties`.
    pub fn load<P: AsRef<Path>>(path: P, properties: &[String]) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.stats_interval", self::log::DEFAULT_STATS_INTERVAL as i64)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // MQBRIDGE__LOG__LEVEL=debug, etc.
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        for property in properties {
            config.apply_property(property)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `<connection>.<property>=<value>` to a connection's properties.
    pub fn apply_property(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let invalid = || {
            ConfigError::Validation(format!(
                "expected <connection>.<property>=<value>, got '{}'",
                assignment
            ))
        };
        let (key, value) = assignment.split_once('=').ok_or_else(invalid)?;
        let (name, property) = key.trim().split_once('.').ok_or_else(invalid)?;

        let connection = self
            .connection
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::Validation(format!("unknown connection '{}'", name)))?;
        connection
            .properties
            .insert(property.to_string(), value.trim().to_string());
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connection.iter().find(|c| c.name == name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for connection in &self.connection {
            connection.validate().map_err(ConfigError::Validation)?;
            if !names.insert(connection.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate connection '{}'",
                    connection.name
                )));
            }
        }

        let mut routes = HashSet::new();
        for route in &self.route {
            route.validate().map_err(ConfigError::Validation)?;
            if !routes.insert(route.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate route '{}'",
                    route.name
                )));
            }
            for name in [&route.from, &route.to] {
                if !names.contains(name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "route '{}' refers to unknown connection '{}'",
                        route.name, name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use mqbridge_core::QoS;

    use super::*;

    const RELAY: &str = r#"
[log]
level = "debug"

[[connection]]
name = "edge"
servers = ["tcp://localhost:1883"]
keep_alive = 30

[[connection]]
name = "cloud"
servers = ["mqtts://broker.example.com"]
username = "bridge"
password = "secret"

[connection.tls]
verify_server_certificate = false

[[route]]
name = "telemetry"
from = "edge"
to = "cloud"
topics = ["sensors/#", "alarms/+"]
max_qos = 1
queue_size = 500
prefix = "site-1/"
"#;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::parse(RELAY).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.connection.len(), 2);

        let edge = config.connection("edge").unwrap().to_client_config().unwrap();
        assert_eq!(edge.keep_alive, Duration::from_secs(30));

        let cloud = config.connection("cloud").unwrap().to_client_config().unwrap();
        assert_eq!(cloud.username.as_deref(), Some("bridge"));
        assert!(!cloud.tls.unwrap().verify_server_certificate);

        let route = &config.route[0];
        assert_eq!(route.max_qos, QoS::AtLeastOnce);
        assert_eq!(route.queue_size, 500);
        assert_eq!(route.prefix.as_deref(), Some("site-1/"));
    }

    #[test]
    fn test_unknown_connection_in_route() {
        let toml = r#"
[[connection]]
name = "edge"
servers = ["tcp://localhost:1883"]

[[route]]
name = "r"
from = "edge"
to = "nowhere"
topics = ["a"]
"#;
        assert!(matches!(
            Config::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_connection() {
        let toml = r#"
[[connection]]
name = "a"
servers = ["tcp://h:1883"]

[[connection]]
name = "a"
servers = ["tcp://h:1884"]
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_apply_property() {
        let mut config = Config::parse(RELAY).unwrap();
        config
            .apply_property("edge.client.max_unack_messages=50")
            .unwrap();
        let edge = config.connection("edge").unwrap().to_client_config().unwrap();
        assert_eq!(edge.max_unack_messages, 50);

        assert!(config.apply_property("nowhere.client.id=x").is_err());
        assert!(config.apply_property("edge").is_err());
    }

    #[test]
    fn test_load_file_with_properties() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RELAY.as_bytes()).unwrap();

        let config = Config::load(file.path(), &["cloud.client.id=cloud-1".to_string()]).unwrap();
        let cloud = config.connection("cloud").unwrap().to_client_config().unwrap();
        assert_eq!(cloud.id, "cloud-1");
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MQBRIDGE_TEST_PORT", "1885");
        let content = r#"servers = ["tcp://localhost:${MQBRIDGE_TEST_PORT}"]"#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("localhost:1885"));
        std::env::remove_var("MQBRIDGE_TEST_PORT");
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQBRIDGE_NONEXISTENT_VAR");
        let content = r#"host = "${MQBRIDGE_NONEXISTENT_VAR:-localhost}""#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("localhost"));
    }
}
