//! Writing side of a route: one publication, optionally re-rooting topics.

use std::sync::Arc;

use log::warn;
use mqbridge_client::{Publication, PublicationConfig, PublicationStats, WriteParams};
use mqbridge_core::ReceivedMessage;

use crate::connection::BrokerConnection;
use crate::error::Result;

pub struct MessageWriter {
    connection: Arc<BrokerConnection>,
    publication: Arc<Publication>,
    prefix: Option<String>,
}

impl MessageWriter {
    pub fn new(
        connection: Arc<BrokerConnection>,
        config: PublicationConfig,
        prefix: Option<String>,
    ) -> Result<Self> {
        let publication = connection.client().publish(config)?;
        Ok(Self {
            connection,
            publication,
            prefix,
        })
    }

    /// Write one message, blocking until the destination acknowledges it.
    pub fn write(&self, message: &ReceivedMessage) -> Result<()> {
        match &self.prefix {
            Some(prefix) if self.publication.config().use_message_info => {
                let params = WriteParams {
                    topic: format!("{}{}", prefix, message.topic),
                    qos: message.info.qos,
                    retained: message.info.retained,
                };
                self.publication
                    .write_with_params(message.payload.clone(), &params)?;
            }
            _ => self.publication.write(message)?,
        }
        Ok(())
    }

    pub fn stats(&self) -> PublicationStats {
        self.publication.stats()
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if let Err(e) = self.connection.client().unpublish(&self.publication) {
            warn!(
                "Writer on '{}' failed to unpublish: {}",
                self.connection.name(),
                e
            );
        }
    }
}
