//! [`MqttApi`] backed by rumqttc's blocking client.
//!
//! Each `connect` starts a session thread that owns a rumqttc `Connection`
//! and drives its event loop. Requests are pushed onto per-kind FIFO queues
//! before being handed to rumqttc, so the `Outgoing` notification carrying
//! the packet identifier can be matched to them; acknowledgements are then
//! correlated by packet identifier.
//!
//! A session ends on the first connection error. Reconnecting is the
//! client's job and creates a fresh session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use mqbridge_core::QoS;
use parking_lot::Mutex;
use rumqttc::{
    ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, SubscribeFilter,
    SubscribeReasonCode, TlsConfiguration, Transport,
};

use crate::api::{ApiEvents, DeliveryToken, MqttApi, SubscriptionParams, WriteParams, WriteRequest};
use crate::config::{ClientConfig, PersistenceLevel, ProtocolVersion};
use crate::error::{ClientError, Result};
use crate::request::Completion;
use crate::tls;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Host, port and transport of one broker URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServerUri {
    /// Parse `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or bare `host[:port]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| ClientError::InvalidConfig(format!("server URI '{}': {}", uri, reason));

        let (tls, rest) = match uri.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => (false, rest),
            Some(("ssl" | "mqtts", rest)) => (true, rest),
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{}'", scheme))),
            None => (false, uri),
        };
        let rest = rest.trim_end_matches('/');
        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("unexpected text after address")),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

struct Write {
    qos: QoS,
    ack: Completion<QoS>,
    delivery: Option<DeliveryToken>,
}

struct UnsubscribeBatch {
    remaining: usize,
    done: Completion<Vec<SubscriptionParams>>,
}

/// Requests waiting for their packet identifier, then for their ack.
#[derive(Default)]
struct Pending {
    disconnect: Option<Completion<()>>,

    outgoing_subscribes: VecDeque<Completion<Vec<SubscriptionParams>>>,
    outgoing_unsubscribes: VecDeque<u64>,
    outgoing_writes: VecDeque<Write>,

    subscribes: AHashMap<u16, Completion<Vec<SubscriptionParams>>>,
    unsubscribes: AHashMap<u16, u64>,
    unsubscribe_batches: AHashMap<u64, UnsubscribeBatch>,
    next_batch: u64,
    writes: AHashMap<u16, Write>,
    deliveries: AHashMap<u16, DeliveryToken>,
}

impl Pending {
    /// Take everything still waiting for the broker. Dropping the returned
    /// value reports each request as abandoned. A queued disconnect stays.
    fn abandon(&mut self) -> Pending {
        let keep = Pending {
            disconnect: self.disconnect.take(),
            next_batch: self.next_batch,
            ..Default::default()
        };
        std::mem::replace(self, keep)
    }

    fn len(&self) -> usize {
        self.outgoing_subscribes.len()
            + self.outgoing_writes.len()
            + self.subscribes.len()
            + self.unsubscribe_batches.len()
            + self.writes.len()
            + self.deliveries.len()
    }
}

struct Session {
    client: rumqttc::Client,
    pending: Mutex<Pending>,
    /// Set once the session is being shut down on purpose.
    closing: AtomicBool,
}

/// Session thread of one `connect` call and the session it currently runs.
struct Runner {
    current: Arc<Mutex<Option<Arc<Session>>>>,
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// rumqttc backend.
pub struct RumqttcApi {
    events: ApiEvents,
    runner: Option<Runner>,
}

impl RumqttcApi {
    /// Check that rumqttc can honour `config`.
    pub fn new(config: &ClientConfig, events: ApiEvents) -> Result<Self> {
        match config.protocol_version {
            ProtocolVersion::Default | ProtocolVersion::Mqtt311 => {}
            other => {
                return Err(ClientError::InvalidConfig(format!(
                    "MQTT protocol version {} is not supported",
                    other
                )));
            }
        }
        for uri in &config.server_uris {
            ServerUri::parse(uri)?;
        }
        if config.uses_tls() {
            tls::build_client_config(&config.tls.clone().unwrap_or_default())?;
        }
        if config.persistence == PersistenceLevel::Durable {
            info!(
                "client {}: durable persistence keeps session state in memory only",
                config.id
            );
        }
        Ok(Self {
            events,
            runner: None,
        })
    }

    fn options(config: &ClientConfig, uri: &ServerUri) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(config.id.clone(), uri.host.clone(), uri.port);
        options.set_keep_alive(keep_alive_interval(&config.id, config.keep_alive));
        options.set_clean_session(
            config.clean_session && config.persistence == PersistenceLevel::None,
        );
        options.set_inflight(config.max_unack_messages.max(1));
        if let Some(username) = &config.username {
            let password = config
                .password
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }
        if uri.tls {
            let tls_config = tls::build_client_config(&config.tls.clone().unwrap_or_default())?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls_config)));
        }
        Ok(options)
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.runner
            .as_ref()
            .and_then(|runner| runner.current.lock().clone())
            .ok_or_else(|| ClientError::InvalidState("not connected".to_string()))
    }

    fn stop_session(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        runner.stopped.store(true, Ordering::SeqCst);
        let session = runner.current.lock().take();
        if let Some(session) = session {
            session.closing.store(true, Ordering::SeqCst);
            if let Err(e) = session.client.try_disconnect() {
                trace!("disconnect on session stop: {}", e);
            }
        }
        if runner.handle.join().is_err() {
            error!("rumqttc session thread panicked");
        }
    }
}

impl Drop for RumqttcApi {
    fn drop(&mut self) {
        self.stop_session();
    }
}

impl MqttApi for RumqttcApi {
    fn connect(&mut self, config: &ClientConfig, done: Completion<()>) -> Result<()> {
        self.stop_session();

        let uris = config
            .server_uris
            .iter()
            .map(|uri| ServerUri::parse(uri))
            .collect::<Result<Vec<_>>>()?;
        let config = config.clone();
        let events = self.events.clone();
        let current = Arc::new(Mutex::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = {
            let current = Arc::clone(&current);
            let stopped = Arc::clone(&stopped);
            thread::Builder::new()
                .name(format!("mqtt-{}", config.id))
                .spawn(move || run_session(config, uris, events, done, current, stopped))?
        };

        self.runner = Some(Runner {
            current,
            stopped,
            handle,
        });
        Ok(())
    }

    fn disconnect(&mut self, done: Completion<()>) -> Result<()> {
        let Ok(session) = self.session() else {
            self.stop_session();
            done.succeed();
            return Ok(());
        };
        session.closing.store(true, Ordering::SeqCst);
        let mut pending = session.pending.lock();
        if let Err(e) = session.client.try_disconnect() {
            drop(pending);
            self.stop_session();
            debug!("disconnect request not queued ({}); session stopped", e);
            done.succeed();
            return Ok(());
        }
        pending.disconnect = Some(done);
        Ok(())
    }

    fn submit_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()> {
        let session = self.session()?;
        let filters: Vec<SubscribeFilter> = done
            .context()
            .iter()
            .map(|p| SubscribeFilter::new(p.topic.clone(), to_rumqttc_qos(p.max_qos)))
            .collect();

        let mut pending = session.pending.lock();
        pending.outgoing_subscribes.push_back(done);
        if let Err(e) = session.client.try_subscribe_many(filters) {
            let done = pending.outgoing_subscribes.pop_back();
            drop(pending);
            drop(done);
            return Err(ClientError::BrokerRejected(format!("subscribe not queued: {}", e)));
        }
        Ok(())
    }

    fn cancel_subscriptions(&mut self, done: Completion<Vec<SubscriptionParams>>) -> Result<()> {
        let session = self.session()?;
        let topics: Vec<String> = done.context().iter().map(|p| p.topic.clone()).collect();
        if topics.is_empty() {
            done.succeed();
            return Ok(());
        }

        let mut pending = session.pending.lock();
        let batch = pending.next_batch;
        pending.next_batch += 1;
        pending.unsubscribe_batches.insert(
            batch,
            UnsubscribeBatch {
                remaining: topics.len(),
                done,
            },
        );

        // rumqttc sends one UNSUBSCRIBE per topic
        for topic in topics {
            pending.outgoing_unsubscribes.push_back(batch);
            if let Err(e) = session.client.try_unsubscribe(topic) {
                // Topics already queued keep their slots so later packet ids
                // still line up; their acks find no batch and are ignored.
                pending.outgoing_unsubscribes.pop_back();
                let batch = pending.unsubscribe_batches.remove(&batch);
                drop(pending);
                drop(batch);
                return Err(ClientError::BrokerRejected(format!("unsubscribe not queued: {}", e)));
            }
        }
        Ok(())
    }

    fn write_message(
        &mut self,
        params: &WriteParams,
        payload: Bytes,
        request: WriteRequest,
    ) -> Result<()> {
        let session = self.session()?;
        let WriteRequest { ack, delivery } = request;

        let mut pending = session.pending.lock();
        pending.outgoing_writes.push_back(Write {
            qos: params.qos,
            ack,
            delivery,
        });
        if let Err(e) = session.client.try_publish(
            params.topic.clone(),
            to_rumqttc_qos(params.qos),
            params.retained,
            payload.to_vec(),
        ) {
            let write = pending.outgoing_writes.pop_back();
            drop(pending);
            drop(write);
            return Err(ClientError::BrokerRejected(format!("publish not queued: {}", e)));
        }
        Ok(())
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_rumqttc_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Try each URI until one connects, then drive the connection until it ends.
fn run_session(
    config: ClientConfig,
    uris: Vec<ServerUri>,
    events: ApiEvents,
    done: Completion<()>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    stopped: Arc<AtomicBool>,
) {
    let mut done = Some(done);
    let mut last_error = String::from("no server URIs");

    for uri in &uris {
        if stopped.load(Ordering::SeqCst) {
            last_error = "connect cancelled".to_string();
            break;
        }
        let options = match RumqttcApi::options(&config, uri) {
            Ok(options) => options,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        info!("client {}: connecting to {}:{}", config.id, uri.host, uri.port);

        let (client, mut connection) = rumqttc::Client::new(options, REQUEST_CAPACITY);
        let session = Arc::new(Session {
            client,
            pending: Mutex::new(Pending::default()),
            closing: AtomicBool::new(false),
        });
        *current.lock() = Some(Arc::clone(&session));

        match await_connack(&config.id, &mut connection) {
            Ok(()) => {
                if let Some(done) = done.take() {
                    done.succeed();
                }
                drive(&config.id, &session, &mut connection, &events);
                return;
            }
            Err(reason) => {
                warn!(
                    "client {}: connection to {}:{} failed: {}",
                    config.id, uri.host, uri.port, reason
                );
                last_error = reason;
                current.lock().take();
            }
        }
    }

    if let Some(done) = done {
        done.fail(format!("could not connect to any server: {}", last_error));
    }
}

fn await_connack(id: &str, connection: &mut Connection) -> std::result::Result<(), String> {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                return match connack.code {
                    ConnectReturnCode::Success => {
                        debug!(
                            "client {}: connected (session present: {})",
                            id, connack.session_present
                        );
                        Ok(())
                    }
                    code => Err(format!("connection refused: {:?}", code)),
                };
            }
            Ok(event) => trace!("client {}: {:?}", id, event),
            Err(e) => return Err(e.to_string()),
        }
    }
    Err("event loop ended".to_string())
}

fn drive(id: &str, session: &Session, connection: &mut Connection, events: &ApiEvents) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(packet)) => on_incoming(id, session, packet, events),
            Ok(Event::Outgoing(outgoing)) => {
                if on_outgoing(id, session, outgoing) {
                    break;
                }
            }
            Err(e) => {
                let abandoned = session.pending.lock().abandon();
                if session.closing.load(Ordering::SeqCst) {
                    debug!("client {}: session closed ({})", id, e);
                } else {
                    warn!(
                        "client {}: connection error: {} ({} request(s) abandoned)",
                        id,
                        e,
                        abandoned.len()
                    );
                }
                drop(abandoned);
                if !session.closing.load(Ordering::SeqCst) {
                    events.connection_lost(e.to_string());
                }
                break;
            }
        }
    }
    let disconnect = session.pending.lock().disconnect.take();
    if let Some(disconnect) = disconnect {
        disconnect.succeed();
    }
    trace!("client {}: session thread stopped", id);
}

fn on_incoming(id: &str, session: &Session, packet: Packet, events: &ApiEvents) {
    match packet {
        Packet::Publish(publish) => {
            events.message_arrived(
                publish.topic,
                publish.payload,
                from_rumqttc_qos(publish.qos),
                publish.retain,
                publish.dup,
            );
        }
        Packet::SubAck(suback) => {
            let done = session.pending.lock().subscribes.remove(&suback.pkid);
            let Some(done) = done else {
                debug!("client {}: SUBACK {} with no request", id, suback.pkid);
                return;
            };
            let refused: Vec<&str> = suback
                .return_codes
                .iter()
                .zip(done.context())
                .filter(|(code, _)| matches!(code, SubscribeReasonCode::Failure))
                .map(|(_, params)| params.topic.as_str())
                .collect();
            if refused.is_empty() {
                done.succeed();
            } else {
                let reason = format!("subscription refused for {:?}", refused);
                done.fail(reason);
            }
        }
        Packet::UnsubAck(unsuback) => {
            let resolved = {
                let mut pending = session.pending.lock();
                let batch = pending.unsubscribes.remove(&unsuback.pkid);
                match batch.and_then(|b| pending.unsubscribe_batches.get_mut(&b).map(|e| (b, e))) {
                    Some((b, entry)) => {
                        entry.remaining -= 1;
                        if entry.remaining == 0 {
                            pending.unsubscribe_batches.remove(&b)
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            if let Some(batch) = resolved {
                batch.done.succeed();
            }
        }
        Packet::PubAck(puback) => {
            let write = session.pending.lock().writes.remove(&puback.pkid);
            match write {
                Some(write) => write.ack.succeed(),
                None => debug!("client {}: PUBACK {} with no write", id, puback.pkid),
            }
        }
        Packet::PubRec(pubrec) => {
            let write = {
                let mut pending = session.pending.lock();
                let mut write = pending.writes.remove(&pubrec.pkid);
                if let Some(token) = write.as_mut().and_then(|w| w.delivery.take()) {
                    pending.deliveries.insert(pubrec.pkid, token);
                }
                write
            };
            match write {
                Some(write) => write.ack.succeed(),
                None => debug!("client {}: PUBREC {} with no write", id, pubrec.pkid),
            }
        }
        Packet::PubComp(pubcomp) => {
            let token = session.pending.lock().deliveries.remove(&pubcomp.pkid);
            match token {
                Some(token) => token.complete(Ok(())),
                None => debug!("client {}: PUBCOMP {} with no delivery", id, pubcomp.pkid),
            }
        }
        other => trace!("client {}: incoming {:?}", id, other),
    }
}

/// Returns `true` once the disconnect has gone out.
fn on_outgoing(id: &str, session: &Session, outgoing: Outgoing) -> bool {
    match outgoing {
        Outgoing::Subscribe(pkid) => {
            let mut pending = session.pending.lock();
            if let Some(done) = pending.outgoing_subscribes.pop_front() {
                pending.subscribes.insert(pkid, done);
            }
        }
        Outgoing::Unsubscribe(pkid) => {
            let mut pending = session.pending.lock();
            if let Some(batch) = pending.outgoing_unsubscribes.pop_front() {
                pending.unsubscribes.insert(pkid, batch);
            }
        }
        Outgoing::Publish(pkid) => {
            let settled = {
                let mut pending = session.pending.lock();
                match pending.outgoing_writes.pop_front() {
                    Some(write) if write.qos == QoS::AtMostOnce => Some(write),
                    Some(write) => {
                        pending.writes.insert(pkid, write);
                        None
                    }
                    None => None,
                }
            };
            if let Some(write) = settled {
                write.ack.succeed();
            }
        }
        Outgoing::Disconnect => {
            debug!("client {}: disconnect sent", id);
            return true;
        }
        other => trace!("client {}: outgoing {:?}", id, other),
    }
    false
}

/// rumqttc takes zero (disabled) or whole seconds; shorter intervals are
/// raised to one second.
fn keep_alive_interval(id: &str, keep_alive: Duration) -> Duration {
    if keep_alive.is_zero() {
        debug!("client {}: keep-alive disabled", id);
        keep_alive
    } else if keep_alive < MIN_KEEP_ALIVE {
        warn!(
            "client {}: keep-alive {:?} raised to {:?}",
            id, keep_alive, MIN_KEEP_ALIVE
        );
        MIN_KEEP_ALIVE
    } else {
        keep_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_interval() {
        assert_eq!(keep_alive_interval("c", Duration::ZERO), Duration::ZERO);
        assert_eq!(
            keep_alive_interval("c", Duration::from_millis(300)),
            Duration::from_secs(1)
        );
        assert_eq!(
            keep_alive_interval("c", Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_parse_uri_schemes() {
        assert_eq!(
            ServerUri::parse("tcp://broker:1884").unwrap(),
            ServerUri { host: "broker".into(), port: 1884, tls: false }
        );
        assert_eq!(
            ServerUri::parse("ssl://broker").unwrap(),
            ServerUri { host: "broker".into(), port: 8883, tls: true }
        );
        assert_eq!(
            ServerUri::parse("mqtts://broker:9000/").unwrap(),
            ServerUri { host: "broker".into(), port: 9000, tls: true }
        );
        assert_eq!(ServerUri::parse("localhost").unwrap().port, 1883);
        assert_eq!(ServerUri::parse("[::1]:1999").unwrap().host, "::1");
    }

    #[test]
    fn test_parse_uri_errors() {
        assert!(ServerUri::parse("ws://broker").is_err());
        assert!(ServerUri::parse("tcp://:1883").is_err());
        assert!(ServerUri::parse("tcp://broker:http").is_err());
        assert!(ServerUri::parse("[::1").is_err());
    }

    #[test]
    fn test_unsupported_protocol_version() {
        let config = ClientConfig::new("tcp://localhost:1883")
            .id("c")
            .protocol_version(ProtocolVersion::Mqtt5);
        assert!(matches!(
            RumqttcApi::new(&config, ApiEvents::unbound()),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_operations_require_session() {
        let config = ClientConfig::new("tcp://localhost:1883").id("c");
        let mut api = RumqttcApi::new(&config, ApiEvents::unbound()).unwrap();
        let request = crate::request::PendingRequest::<Vec<SubscriptionParams>>::new(
            "subscribe",
            mqbridge_core::Timeout::Infinite,
        );
        let done = request.submit(vec![SubscriptionParams::new("a", QoS::AtMostOnce)]);
        assert!(matches!(
            api.submit_subscriptions(done),
            Err(ClientError::InvalidState(_))
        ));
    }
}
