//! Fanout propagation of sightings and deletions between nodes.
//!
//! Delivery is best effort with no acknowledgment. Nodes that miss a
//! message catch up through the reconciliation sweep.

mod disabled;
mod listener;
mod local;
mod message;
mod rabbitmq;
mod redis;

pub use disabled::DisabledMessenger;
pub use listener::SyncListener;
pub use local::LocalBus;
pub use message::{DELETE_CHANNEL, INFO_CHANNEL, SyncMessage};
pub use rabbitmq::RabbitMqMessenger;
pub use redis::RedisMessenger;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Decoded messages from both channels, in arrival order.
pub type Subscription = mpsc::Receiver<SyncMessage>;

/// Buffered messages per subscription before the forwarder waits
pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("malformed sync payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message on unknown channel {0:?}")]
    UnknownChannel(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn publish(&self, message: &SyncMessage) -> Result<(), SyncError>;

    /// Start receiving messages published from now on. The subscription
    /// ends when the transport loses its connection.
    async fn subscribe(&self) -> Result<Subscription, SyncError>;

    /// A standalone messenger has no peers, so its subscriptions end at
    /// once and are never worth renewing.
    fn is_standalone(&self) -> bool {
        false
    }
}

/// Which transport a node uses to reach its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingConfig {
    Redis { url: String },
    RabbitMq { url: String },
    Disabled,
}

pub async fn open_messenger(config: &MessagingConfig) -> Result<Arc<dyn Messenger>, SyncError> {
    Ok(match config {
        MessagingConfig::Redis { url } => Arc::new(RedisMessenger::connect(url).await?),
        MessagingConfig::RabbitMq { url } => Arc::new(RabbitMqMessenger::connect(url).await?),
        MessagingConfig::Disabled => Arc::new(DisabledMessenger),
    })
}
