use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{Endpoint, Tx};
use crate::Result;

pub mod memory;
pub mod mqtt;

pub use memory::{Call, MemoryBus, MemoryConnector};
pub use mqtt::MqttConnector;

/// A live client connection to one broker.
///
/// Messages arriving on the connection's subscriptions are pushed into the channel handed to
/// [`Connector::connect`].
#[async_trait]
pub trait Transport: Sync + Send {
    fn endpoint(&self) -> &Endpoint;

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn disconnect(&self, quiesce: Duration) -> Result<()>;
}

#[async_trait]
pub trait Connector: Sync + Send {
    async fn connect(&self, endpoint: &Endpoint, inbound: Tx) -> Result<Box<dyn Transport>>;
}
