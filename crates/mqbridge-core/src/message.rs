//! Message model exchanged with the transport layer.

use bytes::Bytes;

use crate::qos::QoS;

/// Delivery attributes of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageInfo {
    pub qos: QoS,
    pub retained: bool,
    pub duplicate: bool,
}

/// A message received from (or written to) the broker.
///
/// The payload is opaque. `Bytes` keeps fan-out to several subscriptions
/// cheap since clones share the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub info: MessageInfo,
}

impl ReceivedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            info: MessageInfo::default(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.info.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.info.retained = retained;
        self
    }

    pub fn duplicate(mut self, duplicate: bool) -> Self {
        self.info.duplicate = duplicate;
        self
    }
}
