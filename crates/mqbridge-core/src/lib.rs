//! mqbridge-core - Shared types for the MQTT bridge.
//!
//! Leaf building blocks used by both the client library and the bridge
//! binary: QoS levels, time values, topic filters and the received-message
//! model. Nothing in this crate performs I/O or spawns threads.

pub mod error;
pub mod message;
pub mod qos;
pub mod time;
pub mod topic;

pub use error::{CoreError, Result};
pub use message::{MessageInfo, ReceivedMessage};
pub use qos::QoS;
pub use time::{Time, Timeout};
pub use topic::{validate_topic_name, TopicFilter, MAX_TOPIC_LENGTH};
