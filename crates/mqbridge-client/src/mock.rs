//! In-process MQTT library double.
//!
//! [`MockBroker`] is the test-side handle; [`MockApi`] is the backend the
//! client drives. By default every request is acknowledged on the calling
//! thread. With auto-ack disabled requests are held until the test resolves
//! them, possibly from another thread.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use mqbridge_core::QoS;
use parking_lot::Mutex;

use crate::api::{ApiEvents, DeliveryToken, MqttApi, SubscriptionParams, WriteParams, WriteRequest};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::request::Completion;

/// Kinds of request the mock can reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Write,
}

/// A message the client handed to the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub params: WriteParams,
    pub payload: Bytes,
}

enum Held {
    Connect(Completion<()>),
    Disconnect(Completion<()>),
    Subscribe(Completion<Vec<SubscriptionParams>>),
    Unsubscribe(Completion<Vec<SubscriptionParams>>),
    Write(Completion<QoS>),
}

impl Held {
    fn op(&self) -> MockOp {
        match self {
            Held::Connect(_) => MockOp::Connect,
            Held::Disconnect(_) => MockOp::Disconnect,
            Held::Subscribe(_) => MockOp::Subscribe,
            Held::Unsubscribe(_) => MockOp::Unsubscribe,
            Held::Write(_) => MockOp::Write,
        }
    }

    fn resolve(self, result: Result<()>) {
        match self {
            Held::Connect(c) | Held::Disconnect(c) => c.resolve(result),
            Held::Subscribe(c) | Held::Unsubscribe(c) => c.resolve(result),
            Held::Write(c) => c.resolve(result),
        }
    }
}

enum Dispatch {
    Rejected,
    Acked,
    Held,
}

struct MockState {
    auto_ack: bool,
    auto_deliver: bool,
    connected: bool,
    rejects: Vec<MockOp>,
    held: VecDeque<Held>,
    deliveries: VecDeque<DeliveryToken>,
    connects: usize,
    disconnects: usize,
    subscribes: Vec<Vec<SubscriptionParams>>,
    unsubscribes: Vec<Vec<SubscriptionParams>>,
    writes: Vec<MockWrite>,
    events: Option<ApiEvents>,
}

/// Test-side handle to the mock library.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                auto_ack: true,
                auto_deliver: true,
                connected: false,
                rejects: Vec::new(),
                held: VecDeque::new(),
                deliveries: VecDeque::new(),
                connects: 0,
                disconnects: 0,
                subscribes: Vec::new(),
                unsubscribes: Vec::new(),
                writes: Vec::new(),
                events: None,
            })),
        }
    }

    /// Backend factory for [`Client::new`](crate::Client::new).
    pub fn factory(&self) -> impl FnOnce(&ClientConfig, ApiEvents) -> Result<MockApi> {
        let broker = self.clone();
        move |_config, events| {
            broker.state.lock().events = Some(events);
            Ok(MockApi { broker })
        }
    }

    /// Acknowledge requests on the calling thread (default) or hold them.
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().auto_ack = auto_ack;
    }

    /// Complete QoS 2 deliveries right after the write ack (default) or
    /// hold the tokens for [`complete_deliveries`](Self::complete_deliveries).
    pub fn set_auto_deliver(&self, auto_deliver: bool) {
        self.state.lock().auto_deliver = auto_deliver;
    }

    /// Reject the next request of kind `op`.
    pub fn reject_next(&self, op: MockOp) {
        self.state.lock().rejects.push(op);
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Resolve the oldest held request. Returns its kind, if there was one.
    pub fn resolve_next(&self, result: Result<()>) -> Option<MockOp> {
        let held = self.state.lock().held.pop_front()?;
        let op = held.op();
        self.settle(held, result);
        Some(op)
    }

    /// Acknowledge every held request.
    pub fn release_all(&self) {
        let held: Vec<_> = self.state.lock().held.drain(..).collect();
        for request in held {
            self.settle(request, Ok(()));
        }
    }

    pub fn pending_deliveries(&self) -> usize {
        self.state.lock().deliveries.len()
    }

    /// Fire every held QoS 2 delivery token with `ok`.
    pub fn complete_deliveries(&self, ok: bool) -> usize {
        let tokens: Vec<_> = self.state.lock().deliveries.drain(..).collect();
        let n = tokens.len();
        for token in tokens {
            if ok {
                token.complete(Ok(()));
            } else {
                token.complete(Err(ClientError::BrokerRejected("delivery failed".into())));
            }
        }
        n
    }

    /// Deliver an inbound message to the client.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retained: bool) {
        let events = self.state.lock().events.clone();
        if let Some(events) = events {
            events.message_arrived(topic, payload, qos, retained, false);
        }
    }

    /// Drop the connection as if the network failed.
    pub fn drop_connection(&self, reason: &str) {
        let events = {
            let mut state = self.state.lock();
            state.connected = false;
            state.events.clone()
        };
        debug!("mock broker: dropping connection ({})", reason);
        if let Some(events) = events {
            events.connection_lost(reason);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn subscribe_batches(&self) -> Vec<Vec<SubscriptionParams>> {
        self.state.lock().subscribes.clone()
    }

    pub fn unsubscribe_batches(&self) -> Vec<Vec<SubscriptionParams>> {
        self.state.lock().unsubscribes.clone()
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().writes.clone()
    }

    fn settle(&self, held: Held, result: Result<()>) {
        match (&held, &result) {
            (Held::Connect(_), Ok(())) => self.state.lock().connected = true,
            (Held::Disconnect(_), Ok(())) => self.state.lock().connected = false,
            _ => {}
        }
        held.resolve(result);
    }

    /// Reject, hold or acknowledge a new request. Returns how it was handled.
    fn dispatch(&self, held: Held) -> Dispatch {
        let op = held.op();
        let (rejected, auto_ack) = {
            let mut state = self.state.lock();
            let rejected = match state.rejects.iter().position(|r| *r == op) {
                Some(i) => {
                    state.rejects.remove(i);
                    true
                }
                None => false,
            };
            (rejected, state.auto_ack)
        };

        if rejected {
            debug!("mock broker: rejecting {:?}", op);
            held.resolve(Err(ClientError::BrokerRejected(format!("{:?} rejected", op))));
            Dispatch::Rejected
        } else if auto_ack {
            self.settle(held, Ok(()));
            Dispatch::Acked
        } else {
            self.state.lock().held.push_back(held);
            Dispatch::Held
        }
    }
}

/// Backend half of the mock, owned by the client.
pub struct MockApi {
    broker: MockBroker,
}

impl MqttApi for MockApi {
    fn connect(&mut self, _config: &ClientConfig, done: Completion<()>) -> Result<()> {
        self.broker.state.lock().connects += 1;
        self.broker.dispatch(Held::Connect(done));
        Ok(())
    }

    fn disconnect(&mut self, done: Completion<()>) -> Result<()> {
        self.broker.state.lock().disconnects += 1;
        self.broker.dispatch(Held::Disconnect(done));
        Ok(())
    }

    fn submit_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()> {
        self.broker.state.lock().subscribes.push(done.context().clone());
        self.broker.dispatch(Held::Subscribe(done));
        Ok(())
    }

    fn cancel_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()> {
        self.broker.state.lock().unsubscribes.push(done.context().clone());
        self.broker.dispatch(Held::Unsubscribe(done));
        Ok(())
    }

    fn write_message(
        &mut self,
        params: &WriteParams,
        payload: Bytes,
        request: WriteRequest,
    ) -> Result<()> {
        let auto_deliver = {
            let mut state = self.broker.state.lock();
            state.writes.push(MockWrite {
                params: params.clone(),
                payload,
            });
            state.auto_deliver
        };

        let WriteRequest { ack, delivery } = request;
        let dispatched = self.broker.dispatch(Held::Write(ack));

        // A rejected write drops its token, which reports the delivery failed
        if let Some(token) = delivery {
            match dispatched {
                Dispatch::Rejected => drop(token),
                Dispatch::Acked if auto_deliver => token.complete(Ok(())),
                _ => self.broker.state.lock().deliveries.push_back(token),
            }
        }
        Ok(())
    }
}
