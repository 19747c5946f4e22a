//! Message bus seam for cross-broker fan-out.
//!
//! Every accepted publish is mirrored to the bus; messages the bus hands
//! back are routed to local subscribers. The default [`NullBus`] connects
//! to nothing, which leaves the broker standalone.

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::TopicName;
use crate::Result;

/// Channel on which a bus implementation delivers inbound messages.
pub type BusTx = futures::channel::mpsc::UnboundedSender<(TopicName, Bytes)>;
pub type BusRx = futures::channel::mpsc::UnboundedReceiver<(TopicName, Bytes)>;

#[async_trait]
pub trait Bus: Sync + Send {
    /// Resolves once the bus is connected and usable.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    /// Mirrors a locally published message to the bus.
    async fn publish(&self, topic: &TopicName, payload: &Bytes) -> Result<()>;

    /// Subscribes `pattern` on the bus; deliveries arrive on `tx`.
    async fn subscribe(&self, pattern: &str, tx: BusTx) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Standalone operation: publishes vanish, subscriptions never deliver.
pub struct NullBus;

#[async_trait]
impl Bus for NullBus {
    async fn publish(&self, _topic: &TopicName, _payload: &Bytes) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _pattern: &str, _tx: BusTx) -> Result<()> {
        Ok(())
    }
}
