//! Core error types.

use thiserror::Error;

/// Errors produced while parsing or validating core values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidTopicFilter { filter: String, reason: &'static str },

    #[error("Invalid topic name '{topic}': {reason}")]
    InvalidTopicName { topic: String, reason: &'static str },

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid value for {what}: '{value}'")]
    InvalidValue { what: &'static str, value: String },

    #[error("Time value overflow: {sec}s + {nanosec}ns")]
    TimeOverflow { sec: i64, nanosec: i64 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
