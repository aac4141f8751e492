use super::{Messenger, SUBSCRIPTION_BUFFER, Subscription, SyncError, SyncMessage};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// In-process transport for running several nodes in one process.
///
/// Messages travel encoded, exactly as they would over Redis. Subscribers
/// only see messages published after they subscribed, and a subscriber
/// that falls more than `capacity` messages behind loses the overflow.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(&'static str, String)>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(SUBSCRIPTION_BUFFER)
    }
}

#[async_trait]
impl Messenger for LocalBus {
    async fn publish(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let payload = message.encode()?;
        // No subscribers is not an error on a fanout channel
        let _ = self.tx.send((message.channel(), payload));
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, SyncError> {
        let mut rx = self.tx.subscribe();
        let (tx, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) => match SyncMessage::decode(channel, &payload) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, channel, "dropping undecodable message"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "local bus subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(subscription)
    }
}
