//! Publications: one logical writer and its delivery counters.
//!
//! Every write adds one to `pending` and its terminal result removes it
//! again exactly once. For QoS 0 and 1 the terminal result is the write's
//! acknowledgement. For QoS 2 it is the delivery token, which fires after
//! PUBCOMP (or when the library gives up on the exchange).

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error};
use mqbridge_core::{validate_topic_name, QoS, ReceivedMessage, Timeout};
use parking_lot::Mutex;

use crate::api::{DeliveryToken, WriteParams, WriteRequest};
use crate::config::PublicationConfig;
use crate::error::{ClientError, Result};
use crate::request::PendingRequest;

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicationStats {
    pub sent: u64,
    pub pending: u64,
    pub ok: u64,
    pub error: u64,
}

/// Where a publication hands its writes.
pub(crate) trait MessageSink: Send + Sync {
    fn write_message(&self, params: &WriteParams, payload: Bytes, request: WriteRequest)
        -> Result<()>;
}

fn settle(stats: &Mutex<PublicationStats>, result: &Result<()>) {
    record(&mut stats.lock(), result);
}

fn record(stats: &mut PublicationStats, result: &Result<()>) {
    stats.pending = stats.pending.saturating_sub(1);
    match result {
        Ok(()) => stats.ok += 1,
        Err(_) => stats.error += 1,
    }
}

fn settle_delivery(
    stats: &Mutex<PublicationStats>,
    qos: QoS,
    result: &Result<()>,
) -> Result<()> {
    if qos != QoS::ExactlyOnce {
        return Err(ClientError::InternalConsistency(format!(
            "delivery completion for a QoS {} write",
            qos.level()
        )));
    }
    let mut stats = stats.lock();
    if stats.pending == 0 {
        return Err(ClientError::InternalConsistency(
            "delivery completion with no pending write".to_string(),
        ));
    }
    record(&mut stats, result);
    Ok(())
}

pub struct Publication {
    id: u64,
    config: PublicationConfig,
    stats: Arc<Mutex<PublicationStats>>,
    write_lock: Mutex<()>,
    request: PendingRequest<QoS>,
    sink: Weak<dyn MessageSink>,
}

impl Publication {
    pub(crate) fn new(
        id: u64,
        config: PublicationConfig,
        reply_timeout: Duration,
        sink: Weak<dyn MessageSink>,
    ) -> Result<Self> {
        if !config.use_message_info {
            validate_topic_name(&config.topic)?;
        }

        let wait = if config.max_wait_time.is_zero() {
            reply_timeout
        } else {
            config.max_wait_time
        };

        let stats = Arc::new(Mutex::new(PublicationStats::default()));
        let acked = Arc::clone(&stats);
        let request = PendingRequest::with_handler(
            "write",
            Timeout::from_duration(wait),
            move |qos: &QoS, result: &Result<()>| match qos {
                QoS::AtMostOnce | QoS::AtLeastOnce => settle(&acked, result),
                // Settled by the delivery token
                QoS::ExactlyOnce => {}
            },
        );

        Ok(Self {
            id,
            config,
            stats,
            write_lock: Mutex::new(()),
            request,
            sink,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &PublicationConfig {
        &self.config
    }

    pub fn stats(&self) -> PublicationStats {
        *self.stats.lock()
    }

    /// Write a message. With `use_message_info` its own topic, QoS and
    /// retained flag are used; otherwise the configured ones.
    pub fn write(&self, message: &ReceivedMessage) -> Result<()> {
        let params = if self.config.use_message_info {
            WriteParams {
                topic: message.topic.clone(),
                qos: message.info.qos,
                retained: message.info.retained,
            }
        } else {
            self.configured_params()
        };
        self.write_with_params(message.payload.clone(), &params)
    }

    /// Write `payload` with the configured topic and attributes.
    pub fn write_payload(&self, payload: impl Into<Bytes>) -> Result<()> {
        let params = self.configured_params();
        self.write_with_params(payload.into(), &params)
    }

    /// Write `payload` with explicit parameters and wait for the first
    /// acknowledgement.
    pub fn write_with_params(&self, payload: Bytes, params: &WriteParams) -> Result<()> {
        validate_topic_name(&params.topic)?;
        let sink = self
            .sink
            .upgrade()
            .ok_or_else(|| ClientError::InvalidState("client has been dropped".to_string()))?;

        let _serialized = self.write_lock.lock();

        self.stats.lock().pending += 1;
        let ack = self.request.submit(params.qos);
        let delivery = (params.qos == QoS::ExactlyOnce).then(|| self.delivery_token());

        let len = payload.len();
        sink.write_message(params, payload, WriteRequest { ack, delivery })?;
        self.stats.lock().sent += 1;
        debug!(
            "publication {}: wrote {} bytes to '{}' (QoS {})",
            self.id,
            len,
            params.topic,
            params.qos.level()
        );

        self.request.wait()
    }

    /// Record the delivery result of a QoS 2 write.
    ///
    /// Fails with `InternalConsistency`, leaving the counters untouched, for
    /// any other QoS or when nothing is pending.
    pub fn on_delivery_complete(&self, qos: QoS, result: Result<()>) -> Result<()> {
        settle_delivery(&self.stats, qos, &result)
    }

    fn configured_params(&self) -> WriteParams {
        WriteParams {
            topic: self.config.topic.clone(),
            qos: self.config.qos,
            retained: self.config.retained,
        }
    }

    fn delivery_token(&self) -> DeliveryToken {
        let stats = Arc::clone(&self.stats);
        let id = self.id;
        DeliveryToken::new(move |result| {
            if let Err(e) = settle_delivery(&stats, QoS::ExactlyOnce, &result) {
                error!("publication {}: {}", id, e);
            }
        })
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
