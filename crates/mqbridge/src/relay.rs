//! Relay service.
//!
//! Each route forwards messages from a reader on one connection to a writer
//! on another, on its own thread:
//! - wait for the reader's data-available signal (bounded wait)
//! - drain the queued batch out of the source subscription
//! - write every message to the destination
//!
//! Route statistics are kept in atomics and logged periodically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, info, warn};

use crate::config::{Config, RouteConfig};
use crate::connection::BrokerConnection;
use crate::error::{BridgeError, Result};
use crate::reader::MessageReader;
use crate::writer::MessageWriter;

/// Route statistics.
#[derive(Default)]
pub struct RouteStats {
    /// Messages written to the destination.
    pub forwarded: AtomicU64,
    /// Payload bytes written to the destination.
    pub bytes: AtomicU64,
    /// Messages the destination did not accept.
    pub failed: AtomicU64,
    /// Batches processed.
    pub batches: AtomicU64,
}

impl RouteStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One source-to-destination route.
pub struct Route {
    name: String,
    reader: MessageReader,
    writer: MessageWriter,
    poll_interval: Duration,
    stats: Arc<RouteStats>,
    shutdown: Arc<AtomicBool>,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        reader: MessageReader,
        writer: MessageWriter,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            poll_interval,
            stats: Arc::new(RouteStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<RouteStats> {
        self.stats.clone()
    }

    /// Start the route in a background thread.
    pub fn start(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("route-{}", self.name))
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("Route '{}' started", self.name);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Route '{}' shutting down", self.name);
                break;
            }
            if self.reader.wait(self.poll_interval) {
                self.forward_batch();
            }
        }
    }

    /// Forward everything currently queued. Returns the number of messages
    /// written successfully.
    pub fn forward_batch(&self) -> usize {
        let batch = match self.reader.drain() {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Route '{}' read failed: {}", self.name, e);
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let mut written = 0;
        for message in &batch {
            match self.writer.write(message) {
                Ok(()) => {
                    written += 1;
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes
                        .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Route '{}' failed to forward message on '{}': {}",
                        self.name, message.topic, e
                    );
                }
            }
        }
        let total = batch.len();

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        let queue = self.reader.stats();
        let delivery = self.writer.stats();
        debug!(
            "Route '{}' forwarded {}/{} message(s) (source lost={}, destination pending={})",
            self.name, written, total, queue.lost, delivery.pending
        );
        written
    }
}

/// Owns the connections and runs every route.
pub struct Relay {
    connections: AHashMap<String, Arc<BrokerConnection>>,
    routes: Vec<(String, Arc<RouteStats>, Arc<AtomicBool>)>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            connections: AHashMap::new(),
            routes: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Open every configured connection.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut relay = Self::new();
        for connection in &config.connection {
            relay.add_connection(BrokerConnection::open(connection)?);
        }
        Ok(relay)
    }

    pub fn add_connection(&mut self, connection: BrokerConnection) {
        self.connections
            .insert(connection.name().to_string(), Arc::new(connection));
    }

    pub fn connection(&self, name: &str) -> Result<&Arc<BrokerConnection>> {
        self.connections
            .get(name)
            .ok_or_else(|| BridgeError::UnknownConnection(name.to_string()))
    }

    /// Connect every connection, stopping at the first failure.
    pub fn connect_all(&self) -> Result<()> {
        for connection in self.connections.values() {
            if let Err(e) = connection.connect() {
                error!("Connection '{}' failed: {}", connection.name(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Subscribe the route's source, create its destination writer and
    /// start its thread.
    pub fn start_route(&mut self, config: &RouteConfig) -> Result<()> {
        let source = self.connection(&config.from)?;
        let destination = self.connection(&config.to)?;

        let reader = source.reader(config.subscription_config())?;
        let writer = destination.writer(config.publication_config(), config.prefix.clone())?;
        let route = Route::new(config.name.clone(), reader, writer, config.poll_interval());

        info!(
            "Starting route '{}': {} {:?} -> {}",
            config.name, config.from, config.topics, config.to
        );
        let stats = route.stats();
        let shutdown = route.shutdown.clone();
        let handle = route.start()?;

        self.routes.push((config.name.clone(), stats, shutdown));
        self.handles.push(handle);
        Ok(())
    }

    /// Per-route `(name, forwarded, bytes, failed)`.
    pub fn stats(&self) -> Vec<(String, u64, u64, u64)> {
        self.routes
            .iter()
            .map(|(name, stats, _)| {
                (
                    name.clone(),
                    stats.forwarded.load(Ordering::Relaxed),
                    stats.bytes.load(Ordering::Relaxed),
                    stats.failed.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    pub fn log_stats(&self) {
        for (name, forwarded, bytes, failed) in self.stats() {
            info!(
                "Route '{}': forwarded={} bytes={} failed={}",
                name, forwarded, bytes, failed
            );
        }
    }

    /// Stop all routes, wait for their threads, then disconnect.
    pub fn shutdown(&mut self) {
        for (_, _, shutdown) in &self.routes {
            shutdown.store(true, Ordering::SeqCst);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Route thread panicked");
            }
        }
        for connection in self.connections.values() {
            if let Err(e) = connection.disconnect() {
                warn!("Connection '{}' disconnect failed: {}", connection.name(), e);
            }
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
