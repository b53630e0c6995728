//! Seam between the client and an MQTT library.
//!
//! The client drives a backend through [`MqttApi`]. Each operation carries a
//! [`Completion`] that the backend resolves from its own thread once the
//! broker (or the library) has answered. Unsolicited events flow back through
//! [`ApiEvents`].

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use log::debug;
use mqbridge_core::{QoS, ReceivedMessage};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::request::Completion;

/// One topic filter of a subscribe or unsubscribe batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub topic: String,
    pub max_qos: QoS,
}

impl SubscriptionParams {
    pub fn new(topic: impl Into<String>, max_qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            max_qos,
        }
    }
}

/// Topic and attributes of one outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
}

/// Fires once when a QoS 2 exchange finishes (PUBCOMP received or given up).
///
/// Dropping an unfired token reports the delivery as failed.
pub struct DeliveryToken {
    on_complete: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

impl DeliveryToken {
    pub fn new<F>(on_complete: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self {
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn complete(mut self, result: Result<()>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }
}

impl Drop for DeliveryToken {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Err(ClientError::BrokerRejected(
                "delivery abandoned".to_string(),
            )));
        }
    }
}

impl fmt::Debug for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryToken")
            .field("pending", &self.on_complete.is_some())
            .finish()
    }
}

/// Completion handles for one write.
///
/// `ack` resolves when the library has accepted the message: on send for
/// QoS 0, on PUBACK for QoS 1, on PUBREC for QoS 2. `delivery` is present
/// only for QoS 2.
#[derive(Debug)]
pub struct WriteRequest {
    pub ack: Completion<QoS>,
    pub delivery: Option<DeliveryToken>,
}

/// Receiver of unsolicited backend events.
pub(crate) trait EventSink: Send + Sync {
    fn connection_lost(&self, reason: String);
    fn message_arrived(&self, message: ReceivedMessage);
}

/// Event channel handed to a backend at construction.
///
/// Bound to the client once it exists and holds it weakly: events arriving
/// before binding or after the client is gone are dropped.
#[derive(Clone)]
pub struct ApiEvents {
    sink: Arc<OnceLock<Weak<dyn EventSink>>>,
}

impl ApiEvents {
    /// Events that go nowhere until bound. Backends driven on their own
    /// can keep it unbound.
    pub fn unbound() -> Self {
        Self {
            sink: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn bind(&self, sink: Weak<dyn EventSink>) {
        if self.sink.set(sink).is_err() {
            debug!("event channel already bound");
        }
    }

    fn upgrade(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.get().and_then(Weak::upgrade)
    }

    /// The established connection dropped without a disconnect request.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        match self.upgrade() {
            Some(sink) => sink.connection_lost(reason.into()),
            None => debug!("connection lost with no client attached"),
        }
    }

    /// A PUBLISH arrived from the broker.
    pub fn message_arrived(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
        duplicate: bool,
    ) {
        if let Some(sink) = self.upgrade() {
            let message = ReceivedMessage::new(topic, payload)
                .with_qos(qos)
                .retained(retained)
                .duplicate(duplicate);
            sink.message_arrived(message);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.upgrade().is_some()
    }
}

impl fmt::Debug for ApiEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiEvents")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Operations the client needs from an MQTT library.
///
/// Every method returns once the request is handed to the library; outcomes
/// arrive through the completion. A method that returns `Err` must have
/// dropped (or failed) the completion it was given.
pub trait MqttApi: Send {
    /// Open the connection, trying `config.server_uris` in order.
    fn connect(&mut self, config: &ClientConfig, done: Completion<()>) -> Result<()>;

    fn disconnect(&mut self, done: Completion<()>) -> Result<()>;

    /// Subscribe to every filter in `done.context()` as one batch.
    fn submit_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()>;

    /// Unsubscribe from every filter in `done.context()` as one batch.
    fn cancel_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()>;

    fn write_message(
        &mut self,
        params: &WriteParams,
        payload: Bytes,
        request: WriteRequest,
    ) -> Result<()>;
}
