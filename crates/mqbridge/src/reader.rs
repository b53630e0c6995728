//! Reading side of a route: one subscription plus a wake-up signal.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use log::{debug, warn};
use mqbridge_client::{QueueStats, ReceivedMessage, Subscription, SubscriptionConfig};

use crate::connection::BrokerConnection;
use crate::error::Result;

pub struct MessageReader {
    connection: Arc<BrokerConnection>,
    subscription: Arc<Subscription>,
    data_available: Receiver<()>,
}

impl MessageReader {
    pub fn new(connection: Arc<BrokerConnection>, config: SubscriptionConfig) -> Result<Self> {
        let subscription = connection.client().subscribe(config)?;

        // Capacity 1: one pending wake-up covers any number of arrivals
        let (tx, rx) = bounded(1);
        subscription.set_listener(Arc::new(move |_: &Subscription| {
            let _ = tx.try_send(());
        }));

        debug!(
            "Reader on '{}' subscribed to {:?}",
            connection.name(),
            subscription.config().topics
        );
        Ok(Self {
            connection,
            subscription,
            data_available: rx,
        })
    }

    /// Wait up to `timeout` for unread messages. Returns whether any are queued.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !self.subscription.queue().is_empty() {
            return true;
        }
        let _ = self.data_available.recv_timeout(timeout);
        !self.subscription.queue().is_empty()
    }

    /// Move every queued message out of the subscription.
    ///
    /// The queue is never left loaned, so messages arriving while the batch
    /// is being written are queued rather than refused.
    pub fn drain(&self) -> Result<Vec<ReceivedMessage>> {
        let mut batch = Vec::new();
        let queued = self.subscription.queue().len();
        if queued > 0 {
            self.subscription.read(queued, &mut batch)?;
        }
        Ok(batch)
    }

    pub fn stats(&self) -> QueueStats {
        self.subscription.stats()
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        if let Err(e) = self.connection.client().unsubscribe(&self.subscription) {
            warn!(
                "Reader on '{}' failed to unsubscribe: {}",
                self.connection.name(),
                e
            );
        }
    }
}
