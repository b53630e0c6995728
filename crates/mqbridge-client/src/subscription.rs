//! Subscriptions: topic filters feeding one receive queue.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::{trace, warn};
use mqbridge_core::{ReceivedMessage, Timeout, TopicFilter};
use parking_lot::RwLock;

use crate::api::SubscriptionParams;
use crate::config::SubscriptionConfig;
use crate::error::{ClientError, Result};
use crate::queue::{MessageReceiveQueue, QueueStats, UNLIMITED};
use crate::request::PendingRequest;

/// Notified after a message has been queued on a subscription.
///
/// Runs on the MQTT library's thread with no subscription lock held. Keep it
/// short; waking a reader is the intended use.
pub trait DataAvailableListener: Send + Sync {
    fn on_data_available(&self, subscription: &Subscription);
}

impl<F> DataAvailableListener for F
where
    F: Fn(&Subscription) + Send + Sync,
{
    fn on_data_available(&self, subscription: &Subscription) {
        self(subscription)
    }
}

/// A set of topic filters and the queue their messages land in.
pub struct Subscription {
    id: u64,
    config: SubscriptionConfig,
    filters: Vec<TopicFilter>,
    queue: MessageReceiveQueue,
    listener: RwLock<Option<Arc<dyn DataAvailableListener>>>,
    pub(crate) sub_request: PendingRequest<Vec<SubscriptionParams>>,
    pub(crate) unsub_request: PendingRequest<Vec<SubscriptionParams>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, config: SubscriptionConfig, reply_timeout: Timeout) -> Result<Self> {
        if config.topics.is_empty() {
            return Err(ClientError::InvalidConfig(
                "subscription has no topic filters".to_string(),
            ));
        }
        let filters = config
            .topics
            .iter()
            .map(|topic| TopicFilter::new(topic.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            queue: MessageReceiveQueue::new(config.message_queue_size),
            config,
            filters,
            listener: RwLock::new(None),
            sub_request: PendingRequest::new("subscribe", reply_timeout),
            unsub_request: PendingRequest::new("unsubscribe", reply_timeout),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    /// Whether any filter matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|filter| filter.matches(topic))
    }

    /// Filters with this subscription's max QoS, in configured order.
    pub fn params(&self) -> Vec<SubscriptionParams> {
        self.filters
            .iter()
            .map(|filter| SubscriptionParams::new(filter.as_str(), self.config.max_qos))
            .collect()
    }

    /// Queue `message` if it matches. Returns whether it was queued.
    pub fn receive(&self, message: &ReceivedMessage) -> Result<bool> {
        if !self.matches(&message.topic) {
            return Ok(false);
        }

        if let Some(dropped) = self.queue.receive(message.clone())? {
            warn!(
                "subscription {}: queue full ({}), dropped oldest message on '{}'",
                self.id,
                self.queue.capacity(),
                dropped.topic
            );
        }
        trace!("subscription {}: queued message on '{}'", self.id, message.topic);

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_data_available(self);
        }
        Ok(true)
    }

    /// Move up to `max` messages into `out`, or loan everything with
    /// [`UNLIMITED`] and an empty `out`. See [`MessageReceiveQueue::read`].
    pub fn read(&self, max: usize, out: &mut Vec<ReceivedMessage>) -> Result<usize> {
        self.queue.read(max, out)
    }

    pub fn return_loan(&self, messages: Vec<ReceivedMessage>) -> Result<()> {
        self.queue.return_loan(messages)
    }

    /// Loan every queued message. The batch is returned when the guard drops.
    pub fn take(&self) -> Result<Loan<'_>> {
        let mut messages = Vec::new();
        let n = self.queue.read(UNLIMITED, &mut messages)?;
        Ok(Loan {
            subscription: self,
            messages,
            outstanding: n > 0,
        })
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &MessageReceiveQueue {
        &self.queue
    }

    pub fn set_listener(&self, listener: Arc<dyn DataAvailableListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.config.topics)
            .field("max_qos", &self.config.max_qos)
            .field("queue", &self.queue)
            .finish()
    }
}

/// A loaned batch of messages, returned to its queue on drop.
pub struct Loan<'a> {
    subscription: &'a Subscription,
    messages: Vec<ReceivedMessage>,
    outstanding: bool,
}

impl Loan<'_> {
    pub fn messages(&self) -> &[ReceivedMessage] {
        &self.messages
    }
}

impl Deref for Loan<'_> {
    type Target = [ReceivedMessage];

    fn deref(&self) -> &Self::Target {
        &self.messages
    }
}

impl Drop for Loan<'_> {
    fn drop(&mut self) {
        if !self.outstanding {
            return;
        }
        let messages = std::mem::take(&mut self.messages);
        if let Err(e) = self.subscription.return_loan(messages) {
            warn!("subscription {}: failed to return loan: {}", self.subscription.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mqbridge_core::QoS;

    use super::*;

    fn subscription(topics: &[&str], queue_size: usize) -> Subscription {
        let config = SubscriptionConfig::new(topics.iter().copied())
            .max_qos(QoS::AtLeastOnce)
            .queue_size(queue_size);
        Subscription::new(1, config, Timeout::Infinite).unwrap()
    }

    #[test]
    fn test_rejects_empty_and_invalid_filters() {
        let empty = SubscriptionConfig::default();
        assert!(matches!(
            Subscription::new(1, empty, Timeout::Infinite),
            Err(ClientError::InvalidConfig(_))
        ));

        let invalid = SubscriptionConfig::new(["a/b#"]);
        assert!(Subscription::new(1, invalid, Timeout::Infinite).is_err());
    }

    #[test]
    fn test_receive_only_matching() {
        let sub = subscription(&["sensors/+/temp", "alerts/#"], 0);
        assert!(sub.receive(&ReceivedMessage::new("sensors/a/temp", "1")).unwrap());
        assert!(sub.receive(&ReceivedMessage::new("alerts", "2")).unwrap());
        assert!(!sub.receive(&ReceivedMessage::new("sensors/a/hum", "3")).unwrap());

        let stats = sub.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.unread, 2);
    }

    #[test]
    fn test_params_carry_max_qos() {
        let sub = subscription(&["a/#", "b/+"], 0);
        assert_eq!(
            sub.params(),
            vec![
                SubscriptionParams::new("a/#", QoS::AtLeastOnce),
                SubscriptionParams::new("b/+", QoS::AtLeastOnce),
            ]
        );
    }

    #[test]
    fn test_listener_called_per_queued_message() {
        let sub = subscription(&["t/#"], 0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        sub.set_listener(Arc::new(move |s: &Subscription| {
            // The queue lock is not held here
            assert!(s.stats().unread > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sub.receive(&ReceivedMessage::new("t/1", "a")).unwrap();
        sub.receive(&ReceivedMessage::new("x/1", "b")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sub.clear_listener();
        sub.receive(&ReceivedMessage::new("t/2", "c")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loan_guard_returns_on_drop() {
        let sub = subscription(&["t"], 4);
        for i in 0..3 {
            sub.receive(&ReceivedMessage::new("t", format!("{}", i))).unwrap();
        }

        {
            let loan = sub.take().unwrap();
            assert_eq!(loan.len(), 3);
            assert_eq!(&loan[0].payload[..], b"0");
            assert!(matches!(
                sub.receive(&ReceivedMessage::new("t", "late")),
                Err(ClientError::ReadInProgress)
            ));
        }

        assert!(!sub.queue().is_loaned());
        assert!(sub.receive(&ReceivedMessage::new("t", "after")).unwrap());
        assert_eq!(sub.stats().read, 3);
    }

    #[test]
    fn test_empty_take_leaves_no_loan() {
        let sub = subscription(&["t"], 0);
        let loan = sub.take().unwrap();
        assert!(loan.is_empty());
        drop(loan);
        assert!(!sub.queue().is_loaned());
    }
}
