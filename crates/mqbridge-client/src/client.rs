//! Client connection state machine.
//!
//! The client owns one [`MqttApi`] backend and the registry of its
//! subscriptions and publications. Every broker interaction goes through a
//! [`PendingRequest`]: the request is armed, handed to the backend, and the
//! calling thread waits with no client lock held.
//!
//! Connection losses are reported from the backend's thread and handled on a
//! dedicated worker thread, which reconnects with exponential backoff when
//! enabled. Each successful connect resubmits the filters of every
//! subscription registered at that moment.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use mqbridge_core::{ReceivedMessage, Timeout};
use parking_lot::Mutex;

use crate::api::{ApiEvents, EventSink, MqttApi, SubscriptionParams, WriteParams, WriteRequest};
use crate::config::{ClientConfig, PublicationConfig, SubscriptionConfig};
use crate::error::{ClientError, Result};
use crate::publication::{MessageSink, Publication};
use crate::request::{Completion, PendingRequest};
use crate::subscription::Subscription;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// A broker interaction failed. Cleared by an explicit `connect`.
    Error,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Disconnecting => "DISCONNECTING",
            ClientState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum WorkerCommand {
    ConnectionLost(String),
    Shutdown,
}

struct ClientInner {
    config: ClientConfig,
    state: Mutex<ClientState>,
    api: Mutex<Box<dyn MqttApi>>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    publications: Mutex<Vec<Arc<Publication>>>,

    req_connect: PendingRequest,
    req_disconnect: PendingRequest,
    req_sub_all: PendingRequest<Vec<SubscriptionParams>>,
    req_unsub_all: PendingRequest<Vec<SubscriptionParams>>,

    next_id: AtomicU64,
    /// Bumped by every explicit disconnect; stops an outdated reconnect loop.
    epoch: AtomicU64,
    closing: AtomicBool,
    commands: Sender<WorkerCommand>,
}

/// Synchronous MQTT client.
pub struct Client {
    inner: Arc<ClientInner>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client on top of the backend built by `create`.
    ///
    /// The backend receives the [`ApiEvents`] it must report connection
    /// losses and inbound messages through.
    pub fn new<A, F>(config: ClientConfig, create: F) -> Result<Self>
    where
        A: MqttApi + 'static,
        F: FnOnce(&ClientConfig, ApiEvents) -> Result<A>,
    {
        config.validate()?;

        let events = ApiEvents::unbound();
        let api = create(&config, events.clone())?;

        let connect_timeout = Timeout::from_duration(config.connect_timeout);
        let reply_timeout = Timeout::from_duration(config.max_reply_timeout);
        let (commands, rx) = unbounded();

        let inner = Arc::new(ClientInner {
            req_connect: PendingRequest::new("connect", connect_timeout),
            req_disconnect: PendingRequest::new("disconnect", reply_timeout),
            req_sub_all: PendingRequest::new("subscribe", reply_timeout),
            req_unsub_all: PendingRequest::new("unsubscribe", reply_timeout),
            config,
            state: Mutex::new(ClientState::Disconnected),
            api: Mutex::new(Box::new(api)),
            subscriptions: Mutex::new(Vec::new()),
            publications: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            commands,
        });

        let sink: Weak<dyn EventSink> = Arc::downgrade(&inner) as Weak<ClientInner>;
        events.bind(sink);

        let weak = Arc::downgrade(&inner);
        let worker = thread::Builder::new()
            .name(format!("mqbridge-{}", inner.config.id))
            .spawn(move || run_worker(weak, rx))?;

        info!("client {}: created for {:?}", inner.config.id, inner.config.server_uris);
        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Create a client backed by rumqttc.
    #[cfg(feature = "rumqttc")]
    pub fn with_rumqttc(config: ClientConfig) -> Result<Self> {
        Self::new(config, crate::rumqttc_api::RumqttcApi::new)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Connect and resubscribe every registered subscription.
    ///
    /// Returns immediately when already connected. Fails with `InvalidState`
    /// while a connect or disconnect is in progress.
    pub fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    /// Disconnect, cancelling broker-side subscriptions first when
    /// `unsubscribe_on_disconnect` is set.
    pub fn disconnect(&self) -> Result<()> {
        self.inner.disconnect()
    }

    /// Register a subscription. When connected, its filters are submitted
    /// and acknowledged before this returns; otherwise the next connect
    /// submits them.
    pub fn subscribe(&self, config: SubscriptionConfig) -> Result<Arc<Subscription>> {
        self.inner.subscribe(config)
    }

    /// Remove a subscription, cancelling filters no other subscription uses.
    pub fn unsubscribe(&self, subscription: &Arc<Subscription>) -> Result<()> {
        self.inner.unsubscribe(subscription)
    }

    pub fn publish(&self, config: PublicationConfig) -> Result<Arc<Publication>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sink: Weak<dyn MessageSink> = Arc::downgrade(&self.inner) as Weak<ClientInner>;
        let publication = Arc::new(Publication::new(
            id,
            config,
            self.inner.config.max_reply_timeout,
            sink,
        )?);
        self.inner.publications.lock().push(Arc::clone(&publication));
        info!(
            "client {}: publication {} created (topic '{}')",
            self.inner.config.id,
            id,
            publication.config().topic
        );
        Ok(publication)
    }

    pub fn unpublish(&self, publication: &Arc<Publication>) -> Result<()> {
        let mut publications = self.inner.publications.lock();
        let index = publications
            .iter()
            .position(|p| Arc::ptr_eq(p, publication))
            .ok_or_else(|| {
                ClientError::InvalidState(format!(
                    "publication {} is not registered",
                    publication.id()
                ))
            })?;
        publications.remove(index);
        debug!("client {}: publication {} removed", self.inner.config.id, publication.id());
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn publication_count(&self) -> usize {
        self.inner.publications.lock().len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let _ = self.inner.commands.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("client {}: worker thread panicked", self.inner.config.id);
            }
        }
        self.inner.finalize();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.config.id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .field("publications", &self.publication_count())
            .finish()
    }
}

impl ClientInner {
    fn set_state(&self, next: ClientState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            info!("client {}: {} -> {}", self.config.id, prev, next);
        }
    }

    /// Move to `Error` after a failed broker interaction.
    fn broker_failure(&self, e: ClientError) -> ClientError {
        if matches!(e, ClientError::BrokerRejected(_) | ClientError::Timeout(_)) {
            self.set_state(ClientState::Error);
        }
        e
    }

    fn connect(&self) -> Result<()> {
        self.connect_in(None)
    }

    /// Connect, or with `epoch` only if no disconnect happened since it was
    /// taken.
    fn connect_in(&self, epoch: Option<u64>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(epoch) = epoch {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return Err(ClientError::InvalidState(
                        "superseded by disconnect".to_string(),
                    ));
                }
            }
            match *state {
                ClientState::Connected => return Ok(()),
                ClientState::Connecting | ClientState::Disconnecting => {
                    return Err(ClientError::InvalidState(format!(
                        "cannot connect while {}",
                        *state
                    )));
                }
                ClientState::Disconnected | ClientState::Error => {
                    *state = ClientState::Connecting;
                }
            }
        }
        info!("client {}: connecting", self.config.id);

        match self.open_session() {
            Ok(submitted) => self.finish_connect(submitted),
            Err(e) => {
                warn!("client {}: connect failed: {}", self.config.id, e);
                self.set_state(ClientState::Error);
                Err(e)
            }
        }
    }

    /// Connect and subscribe the registered filters. Returns the filters
    /// submitted.
    fn open_session(&self) -> Result<Vec<SubscriptionParams>> {
        let done = self.req_connect.submit(());
        if let Err(e) = self.api.lock().connect(&self.config, done) {
            self.req_connect.cancel();
            return Err(e);
        }
        self.req_connect.wait()?;
        self.submit_all_subscriptions()
    }

    /// Enter `Connected`, then submit or cancel the filters of
    /// subscriptions added or removed after `submitted` was taken.
    ///
    /// The state changes under the subscription lock, so a concurrent
    /// `subscribe` either lands in this reconciliation or sees `Connected`
    /// and submits its own filters.
    fn finish_connect(&self, submitted: Vec<SubscriptionParams>) -> Result<()> {
        let (added, removed) = {
            let subscriptions = self.subscriptions.lock();
            self.set_state(ClientState::Connected);
            let current = merged_params(&subscriptions, None);
            let added: Vec<_> = current
                .iter()
                .filter(|p| {
                    !submitted
                        .iter()
                        .any(|s| s.topic == p.topic && s.max_qos >= p.max_qos)
                })
                .cloned()
                .collect();
            let removed: Vec<_> = submitted
                .into_iter()
                .filter(|s| !current.iter().any(|p| p.topic == s.topic))
                .collect();
            (added, removed)
        };

        if !added.is_empty() {
            debug!(
                "client {}: submitting {} filter(s) registered while connecting",
                self.config.id,
                added.len()
            );
            self.exchange(&self.req_sub_all, added, |api, done| api.submit_subscriptions(done))
                .map_err(|e| self.broker_failure(e))?;
        }
        if !removed.is_empty() {
            debug!(
                "client {}: cancelling {} filter(s) removed while connecting",
                self.config.id,
                removed.len()
            );
            self.exchange(&self.req_unsub_all, removed, |api, done| api.cancel_subscriptions(done))
                .map_err(|e| self.broker_failure(e))?;
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let was_connected = {
            let mut state = self.state.lock();
            match *state {
                // A reconnect may still be waiting for its next attempt
                ClientState::Disconnected => {
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                ClientState::Connecting | ClientState::Disconnecting => {
                    return Err(ClientError::InvalidState(format!(
                        "cannot disconnect while {}",
                        *state
                    )));
                }
                ClientState::Connected | ClientState::Error => {
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    let was_connected = *state == ClientState::Connected;
                    *state = ClientState::Disconnecting;
                    was_connected
                }
            }
        };
        info!("client {}: disconnecting", self.config.id);

        let result = self.close_session(was_connected);
        match &result {
            Ok(()) => self.set_state(ClientState::Disconnected),
            Err(e) => {
                warn!("client {}: disconnect failed: {}", self.config.id, e);
                self.set_state(ClientState::Error);
            }
        }
        result
    }

    fn close_session(&self, was_connected: bool) -> Result<()> {
        if was_connected && self.config.unsubscribe_on_disconnect {
            self.cancel_all_subscriptions()?;
        }
        let done = self.req_disconnect.submit(());
        if let Err(e) = self.api.lock().disconnect(done) {
            self.req_disconnect.cancel();
            return Err(e);
        }
        self.req_disconnect.wait()
    }

    /// Subscribe to the current filter set as one batch. Returns the
    /// filters submitted.
    fn submit_all_subscriptions(&self) -> Result<Vec<SubscriptionParams>> {
        let params = merged_params(&self.subscriptions.lock(), None);
        if params.is_empty() {
            return Ok(params);
        }
        debug!(
            "client {}: submitting {} subscription filter(s)",
            self.config.id,
            params.len()
        );
        self.exchange(&self.req_sub_all, params.clone(), |api, done| {
            api.submit_subscriptions(done)
        })?;
        Ok(params)
    }

    fn cancel_all_subscriptions(&self) -> Result<()> {
        let params = merged_params(&self.subscriptions.lock(), None);
        if params.is_empty() {
            return Ok(());
        }
        self.exchange(&self.req_unsub_all, params, |api, done| api.cancel_subscriptions(done))
    }

    /// Arm `request`, hand it to the backend, and wait for its result.
    fn exchange<F>(
        &self,
        request: &PendingRequest<Vec<SubscriptionParams>>,
        params: Vec<SubscriptionParams>,
        call: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Box<dyn MqttApi>, Completion<Vec<SubscriptionParams>>) -> Result<()>,
    {
        let done = request.submit(params);
        {
            let mut api = self.api.lock();
            if let Err(e) = call(&mut api, done) {
                request.cancel();
                return Err(e);
            }
        }
        request.wait()
    }

    fn subscribe(&self, config: SubscriptionConfig) -> Result<Arc<Subscription>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription::new(
            id,
            config,
            Timeout::from_duration(self.config.max_reply_timeout),
        )?);

        let (params, connected) = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.push(Arc::clone(&subscription));
            let connected = *self.state.lock() == ClientState::Connected;
            (
                merged_params(&subscriptions, Some(subscription.config().topics.as_slice())),
                connected,
            )
        };

        if connected {
            let result = self.exchange(&subscription.sub_request, params, |api, done| {
                api.submit_subscriptions(done)
            });
            if let Err(e) = result {
                warn!("client {}: subscription {} failed: {}", self.config.id, id, e);
                self.remove_subscription(&subscription);
                return Err(self.broker_failure(e));
            }
        }

        info!(
            "client {}: subscription {} created for {:?} (max QoS {}, queue {})",
            self.config.id,
            id,
            subscription.config().topics,
            subscription.config().max_qos,
            subscription.config().message_queue_size
        );
        Ok(subscription)
    }

    fn unsubscribe(&self, subscription: &Arc<Subscription>) -> Result<()> {
        let (params, connected) = {
            let mut subscriptions = self.subscriptions.lock();
            let index = subscriptions
                .iter()
                .position(|s| Arc::ptr_eq(s, subscription))
                .ok_or_else(|| {
                    ClientError::InvalidState(format!(
                        "subscription {} is not registered",
                        subscription.id()
                    ))
                })?;
            subscriptions.remove(index);

            let still_used = merged_params(&subscriptions, None);
            let params = subscription
                .params()
                .into_iter()
                .filter(|p| !still_used.iter().any(|u| u.topic == p.topic))
                .collect::<Vec<_>>();
            (params, *self.state.lock() == ClientState::Connected)
        };
        subscription.clear_listener();
        debug!("client {}: subscription {} removed", self.config.id, subscription.id());

        if params.is_empty() || !connected {
            return Ok(());
        }
        self.exchange(&subscription.unsub_request, params, |api, done| {
            api.cancel_subscriptions(done)
        })
        .map_err(|e| self.broker_failure(e))
    }

    fn remove_subscription(&self, subscription: &Arc<Subscription>) {
        self.subscriptions
            .lock()
            .retain(|s| !Arc::ptr_eq(s, subscription));
    }

    /// Tear down children and the connection before the client goes away.
    fn finalize(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().clone();
        for subscription in &subscriptions {
            if let Err(e) = self.unsubscribe(subscription) {
                warn!(
                    "client {}: failed to unsubscribe {}: {}",
                    self.config.id,
                    subscription.id(),
                    e
                );
            }
        }
        self.publications.lock().clear();

        if let Err(e) = self.disconnect() {
            warn!("client {}: disconnect on drop failed: {}", self.config.id, e);
        }
        debug!("client {}: finalized", self.config.id);
    }

    fn handle_connection_lost(&self, reason: &str, commands: &Receiver<WorkerCommand>) -> bool {
        let epoch = {
            let mut state = self.state.lock();
            if *state != ClientState::Connected {
                debug!(
                    "client {}: ignoring connection loss while {}",
                    self.config.id, *state
                );
                return true;
            }
            *state = ClientState::Disconnected;
            self.epoch.load(Ordering::SeqCst)
        };
        warn!("client {}: connection lost: {}", self.config.id, reason);

        if !self.config.reconnect {
            info!("client {}: reconnect disabled", self.config.id);
            return true;
        }
        self.reconnect(epoch, commands)
    }

    /// Reconnect with backoff, waiting before every attempt. Returns
    /// `false` when shutdown was requested.
    fn reconnect(&self, epoch: u64, commands: &Receiver<WorkerCommand>) -> bool {
        let backoff = self.config.reconnect_backoff;
        let max_retries = self.config.max_connection_retries;
        let mut delay = backoff.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            match commands.recv_timeout(delay) {
                Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Ok(WorkerCommand::ConnectionLost(reason)) => {
                    trace!("client {}: already reconnecting ({})", self.config.id, reason);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.closing.load(Ordering::SeqCst) {
                return false;
            }
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("client {}: reconnect superseded by disconnect", self.config.id);
                return true;
            }

            attempt += 1;
            info!("client {}: reconnect attempt {}", self.config.id, attempt);
            match self.connect_in(Some(epoch)) {
                Ok(()) => {
                    info!("client {}: reconnected", self.config.id);
                    return true;
                }
                Err(ClientError::InvalidState(reason)) => {
                    debug!("client {}: reconnect skipped: {}", self.config.id, reason);
                    return true;
                }
                Err(e) => warn!("client {}: reconnect attempt {} failed: {}", self.config.id, attempt, e),
            }

            if max_retries > 0 && attempt >= max_retries {
                error!(
                    "client {}: giving up after {} reconnect attempts",
                    self.config.id, attempt
                );
                return true;
            }
            delay = backoff.next_delay(delay);
        }
    }
}

impl EventSink for ClientInner {
    fn connection_lost(&self, reason: String) {
        if self.commands.send(WorkerCommand::ConnectionLost(reason)).is_err() {
            debug!("client {}: worker gone, connection loss ignored", self.config.id);
        }
    }

    fn message_arrived(&self, message: ReceivedMessage) {
        trace!(
            "client {}: message on '{}' ({} bytes)",
            self.config.id,
            message.topic,
            message.payload.len()
        );
        let subscriptions: Vec<_> = self.subscriptions.lock().clone();
        let mut delivered = 0;
        for subscription in subscriptions.iter() {
            match subscription.receive(&message) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "client {}: subscription {} rejected message on '{}': {}",
                    self.config.id,
                    subscription.id(),
                    message.topic,
                    e
                ),
            }
        }
        if delivered == 0 {
            debug!("client {}: no subscription for '{}'", self.config.id, message.topic);
        }
    }
}

impl MessageSink for ClientInner {
    fn write_message(
        &self,
        params: &WriteParams,
        payload: Bytes,
        request: WriteRequest,
    ) -> Result<()> {
        let state = *self.state.lock();
        if state != ClientState::Connected {
            return Err(ClientError::InvalidState(format!("cannot write while {}", state)));
        }
        self.api.lock().write_message(params, payload, request)
    }
}

/// Filters of `subscriptions`, deduplicated with the highest max QoS per
/// filter. With `only`, restricted to those filters.
fn merged_params(
    subscriptions: &[Arc<Subscription>],
    only: Option<&[String]>,
) -> Vec<SubscriptionParams> {
    let mut merged: Vec<SubscriptionParams> = Vec::new();
    let mut index: AHashMap<String, usize> = AHashMap::new();

    for param in subscriptions.iter().flat_map(|s| s.params()) {
        if let Some(only) = only {
            if !only.iter().any(|t| *t == param.topic) {
                continue;
            }
        }
        match index.get(&param.topic) {
            Some(&i) => {
                if param.max_qos > merged[i].max_qos {
                    merged[i].max_qos = param.max_qos;
                }
            }
            None => {
                index.insert(param.topic.clone(), merged.len());
                merged.push(param);
            }
        }
    }
    merged
}

fn run_worker(inner: Weak<ClientInner>, commands: Receiver<WorkerCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Shutdown => break,
            WorkerCommand::ConnectionLost(reason) => {
                let Some(inner) = inner.upgrade() else { break };
                if !inner.handle_connection_lost(&reason, &commands) {
                    break;
                }
            }
        }
    }
    trace!("client worker stopped");
}
