//! Message bus adapters.

use async_trait::async_trait;
use hmibridge_core::Result;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe transport. Inbound messages are delivered on the
/// channel returned when the adapter is created.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Subscribe to `topic`; subscriptions survive reconnects.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
