//! mqbridge-client - Synchronous MQTT client core for bridging.
//!
//! Wraps an asynchronous MQTT backend behind blocking calls: every broker
//! interaction is correlated through a [`PendingRequest`], received messages
//! land in per-subscription [`MessageReceiveQueue`]s and are read under a
//! loan, and publications track delivery per QoS level.
//!
//! # Example
//!
//! ```ignore
//! use mqbridge_client::{Client, ClientConfig, PublicationConfig, QoS, SubscriptionConfig};
//!
//! let client = Client::with_rumqttc(ClientConfig::new("tcp://localhost:1883").id("bridge"))?;
//! client.connect()?;
//!
//! let sub = client.subscribe(SubscriptionConfig::new(["sensors/#"]).max_qos(QoS::AtLeastOnce))?;
//! let publ = client.publish(PublicationConfig::new("archive/sensors").qos(QoS::ExactlyOnce))?;
//!
//! let loan = sub.take()?;
//! for message in loan.iter() {
//!     publ.write_payload(message.payload.clone())?;
//! }
//! ```
//!
//! The [`MockBroker`] backend drives the same client without a network and
//! is what the tests use.

pub mod api;
mod client;
mod config;
mod error;
pub mod mock;
pub mod properties;
mod publication;
mod queue;
mod request;
#[cfg(feature = "rumqttc")]
mod rumqttc_api;
mod subscription;
#[cfg(feature = "rumqttc")]
mod tls;

pub use api::{ApiEvents, DeliveryToken, MqttApi, SubscriptionParams, WriteParams, WriteRequest};
pub use client::{Client, ClientState};
pub use config::{
    ClientConfig, PersistenceLevel, ProtocolVersion, PublicationConfig, ReconnectBackoff,
    SubscriptionConfig, TlsConfig, TlsVersion,
};
pub use error::{ClientError, Result};
pub use mock::{MockBroker, MockOp};
pub use properties::Properties;
pub use publication::{Publication, PublicationStats};
pub use queue::{MessageReceiveQueue, QueueStats, UNLIMITED};
pub use request::{Completion, PendingRequest};
#[cfg(feature = "rumqttc")]
pub use rumqttc_api::{RumqttcApi, ServerUri};
pub use subscription::{DataAvailableListener, Loan, Subscription};

// Re-export the shared types
pub use mqbridge_core::{MessageInfo, QoS, ReceivedMessage, Time, Timeout, TopicFilter};
