use super::{Messenger, Subscription, SyncError, SyncMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Standalone node: nothing is sent, the subscription ends immediately.
pub struct DisabledMessenger;

#[async_trait]
impl Messenger for DisabledMessenger {
    async fn publish(&self, _message: &SyncMessage) -> Result<(), SyncError> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, SyncError> {
        let (_, subscription) = mpsc::channel(1);
        Ok(subscription)
    }

    fn is_standalone(&self) -> bool {
        true
    }
}
