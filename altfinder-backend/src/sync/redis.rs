use super::{
    DELETE_CHANNEL, INFO_CHANNEL, Messenger, SUBSCRIPTION_BUFFER, Subscription, SyncError,
    SyncMessage,
};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Redis PUBLISH/SUBSCRIBE on the info and delete channels.
#[derive(Clone)]
pub struct RedisMessenger {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisMessenger {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Messenger for RedisMessenger {
    async fn publish(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let payload = message.encode()?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(message.channel(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, SyncError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(INFO_CHANNEL).await?;
        pubsub.subscribe(DELETE_CHANNEL).await?;
        info!("subscribed to redis sync channels");

        let (tx, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, %channel, "dropping non-text sync payload");
                        continue;
                    }
                };
                match SyncMessage::decode(&channel, &payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, %channel, "dropping undecodable message"),
                }
            }
            debug!("redis subscription closed");
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Needs a disposable Redis, e.g.
    /// `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_publish_reaches_subscriber() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let messenger = RedisMessenger::connect(&url).await.unwrap();
        let mut subscription = messenger.subscribe().await.unwrap();

        let message = SyncMessage::Delete {
            key: "198.51.100.1".to_string(),
        };
        messenger.publish(&message).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(message));
    }
}
