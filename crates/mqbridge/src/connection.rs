//! A named broker connection shared by the readers and writers on it.

use std::fmt;
use std::sync::Arc;

use log::info;
use mqbridge_client::{Client, PublicationConfig, SubscriptionConfig};

use crate::error::Result;
use crate::reader::MessageReader;
use crate::writer::MessageWriter;

pub struct BrokerConnection {
    name: String,
    client: Client,
}

impl BrokerConnection {
    /// Wrap an existing client.
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// Open a rumqttc-backed connection from its configuration.
    pub fn open(config: &crate::config::ConnectionConfig) -> Result<Self> {
        let client_config = config
            .to_client_config()
            .map_err(crate::config::ConfigError::Validation)?;
        Ok(Self::new(config.name.clone(), Client::with_rumqttc(client_config)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn connect(&self) -> Result<()> {
        self.client.connect()?;
        info!(
            "Connection '{}' up ({:?})",
            self.name,
            self.client.config().server_uris
        );
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client.disconnect()?;
        info!("Connection '{}' closed", self.name);
        Ok(())
    }

    /// Subscribe and return a reader for the subscription.
    pub fn reader(self: &Arc<Self>, config: SubscriptionConfig) -> Result<MessageReader> {
        MessageReader::new(Arc::clone(self), config)
    }

    /// Create a publication and return a writer for it.
    pub fn writer(
        self: &Arc<Self>,
        config: PublicationConfig,
        prefix: Option<String>,
    ) -> Result<MessageWriter> {
        MessageWriter::new(Arc::clone(self), config, prefix)
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("name", &self.name)
            .field("state", &self.client.state())
            .finish()
    }
}
