//! Topic filter validation and matching.
//!
//! Filters are hierarchical `/`-separated paths with two wildcards:
//! - `+` matches exactly one non-empty level
//! - `#` matches the remainder of the topic, including the parent level
//!   itself (`a/#` matches `a`), and must be the last level of the filter
//!
//! Both wildcards must occupy a whole level. Filters are validated once at
//! construction so that matching never has to deal with malformed input.

use std::fmt;

use crate::error::{CoreError, Result};

/// Maximum topic length in bytes (MQTT UTF-8 string limit).
pub const MAX_TOPIC_LENGTH: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    SingleWildcard,
    MultiWildcard,
}

/// A validated topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    filter: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    /// Parse and validate a filter.
    pub fn new(filter: impl Into<String>) -> Result<Self> {
        let filter = filter.into();
        let invalid = |reason| CoreError::InvalidTopicFilter {
            filter: filter.clone(),
            reason,
        };

        if filter.is_empty() {
            return Err(invalid("empty filter"));
        }
        if filter.len() > MAX_TOPIC_LENGTH {
            return Err(invalid("filter too long"));
        }

        let mut levels = Vec::new();
        let mut parts = filter.split('/').peekable();
        while let Some(part) = parts.next() {
            let level = match part {
                "+" => Level::SingleWildcard,
                "#" => {
                    if parts.peek().is_some() {
                        return Err(invalid("'#' must be the last level"));
                    }
                    Level::MultiWildcard
                }
                lit if lit.contains(['+', '#']) => {
                    return Err(invalid("wildcard must occupy a whole level"));
                }
                lit => Level::Literal(lit.to_string()),
            };
            levels.push(level);
        }

        Ok(Self { filter, levels })
    }

    /// The filter as originally written.
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    /// Whether the filter contains `+` or `#`.
    pub fn has_wildcards(&self) -> bool {
        self.levels
            .iter()
            .any(|l| !matches!(l, Level::Literal(_)))
    }

    /// Match a topic name against this filter.
    pub fn matches(&self, topic: &str) -> bool {
        // MQTT-4.7.2-1: $-topics are not matched by a wildcard in the first level
        if topic.starts_with('$') && !matches!(self.levels.first(), Some(Level::Literal(_))) {
            return false;
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::MultiWildcard => return true,
                Level::SingleWildcard => match topic_levels.next() {
                    Some(l) if !l.is_empty() => {}
                    _ => return false,
                },
                Level::Literal(lit) => match topic_levels.next() {
                    Some(l) if l == lit => {}
                    _ => return false,
                },
            }
        }

        // Filter exhausted: the topic must be too
        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}

/// Validate a topic name used for publishing.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    let invalid = |reason| CoreError::InvalidTopicName {
        topic: topic.to_string(),
        reason,
    };
    if topic.is_empty() {
        return Err(invalid("empty topic"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(invalid("topic too long"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid("wildcards are not allowed in topic names"));
    }
    Ok(())
}
