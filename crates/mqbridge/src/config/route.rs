//! Route configuration: what to read from one connection and where to write it.

use std::time::Duration;

use mqbridge_client::{PublicationConfig, SubscriptionConfig};
use mqbridge_core::{validate_topic_name, QoS};
use serde::Deserialize;

/// Default bound on one wait for data, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// One `[[route]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    /// Source connection name.
    pub from: String,
    /// Destination connection name.
    pub to: String,

    // === Source subscription ===
    /// Topic filters subscribed on the source.
    pub topics: Vec<String>,
    #[serde(default)]
    pub max_qos: QoS,
    /// Receive queue capacity (0 = unbounded).
    #[serde(default)]
    pub queue_size: usize,

    // === Destination publication ===
    /// Fixed destination topic. Unset: each message keeps its own topic,
    /// QoS and retained flag.
    #[serde(default)]
    pub topic: Option<String>,
    /// QoS for the fixed destination topic.
    #[serde(default)]
    pub qos: QoS,
    /// Retained flag for the fixed destination topic.
    #[serde(default)]
    pub retained: bool,
    /// Prepended to each message's own topic.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Milliseconds to wait for each write's acknowledgement (0 = the
    /// destination's reply timeout).
    #[serde(default)]
    pub max_wait_ms: u64,

    /// Upper bound on one wait for new data, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl RouteConfig {
    #[allow(dead_code)]
    pub fn new(
        name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        topics: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            max_qos: QoS::AtMostOnce,
            queue_size: 0,
            topic: None,
            qos: QoS::AtMostOnce,
            retained: false,
            prefix: None,
            max_wait_ms: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig::new(self.topics.iter().cloned())
            .max_qos(self.max_qos)
            .queue_size(self.queue_size)
    }

    pub fn publication_config(&self) -> PublicationConfig {
        let config = match &self.topic {
            Some(topic) => PublicationConfig::new(topic.clone())
                .qos(self.qos)
                .retained(self.retained),
            None => PublicationConfig::from_message_info(),
        };
        config.max_wait_time(Duration::from_millis(self.max_wait_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Validate the route on its own; connection names are checked by
    /// [`Config::validate`](super::Config::validate).
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("route name must not be empty".into());
        }
        if self.topics.is_empty() {
            return Err(format!("route '{}': no topics", self.name));
        }
        if let Some(topic) = &self.topic {
            validate_topic_name(topic).map_err(|e| format!("route '{}': {}", self.name, e))?;
            if self.prefix.is_some() {
                return Err(format!(
                    "route '{}': prefix only applies without a fixed topic",
                    self.name
                ));
            }
        }
        if self.from == self.to && self.topic.is_none() && self.prefix.is_none() {
            return Err(format!(
                "route '{}': forwarding to the same connection without a topic change loops",
                self.name
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_info_by_default() {
        let route = RouteConfig::new("r", "a", "b", &["x/#"]);
        assert!(route.validate().is_ok());
        assert!(route.publication_config().use_message_info);
        assert_eq!(route.subscription_config().topics, vec!["x/#"]);
    }

    #[test]
    fn test_fixed_topic() {
        let mut route = RouteConfig::new("r", "a", "b", &["x/#"]);
        route.topic = Some("archive/x".into());
        route.qos = QoS::ExactlyOnce;
        let publication = route.publication_config();
        assert!(!publication.use_message_info);
        assert_eq!(publication.topic, "archive/x");
        assert_eq!(publication.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_invalid_routes() {
        let mut route = RouteConfig::new("r", "a", "b", &[]);
        assert!(route.validate().is_err());

        route.topics = vec!["x".into()];
        route.topic = Some("bad/+".into());
        assert!(route.validate().is_err());

        route.topic = Some("good".into());
        route.prefix = Some("p/".into());
        assert!(route.validate().is_err());

        let route = RouteConfig::new("loop", "a", "a", &["x/#"]);
        assert!(route.validate().is_err());
    }
}
