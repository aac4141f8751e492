use super::{
    DELETE_CHANNEL, INFO_CHANNEL, Messenger, SUBSCRIPTION_BUFFER, Subscription, SyncError,
    SyncMessage,
};
use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Fanout exchanges named after the two sync channels. Every subscriber
/// binds its own exclusive, auto-deleted queue to both.
pub struct RabbitMqMessenger {
    url: String,
    link: Mutex<Link>,
}

/// A connection and the channel used for publishing on it.
struct Link {
    conn: Connection,
    publisher: Channel,
}

impl Link {
    async fn open(url: &str) -> Result<Self, SyncError> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let publisher = conn.create_channel().await?;
        declare_exchanges(&publisher).await?;
        Ok(Self { conn, publisher })
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected() && self.publisher.status().connected()
    }
}

async fn declare_exchanges(channel: &Channel) -> Result<(), SyncError> {
    for exchange in [INFO_CHANNEL, DELETE_CHANNEL] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

impl RabbitMqMessenger {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        let link = Link::open(url).await?;
        info!("connected to rabbitmq");
        Ok(Self {
            url: url.to_string(),
            link: Mutex::new(link),
        })
    }

    /// The current link, reopened first if the broker dropped it.
    async fn link(&self) -> Result<MutexGuard<'_, Link>, SyncError> {
        let mut link = self.link.lock().await;
        if !link.is_open() {
            warn!("rabbitmq connection lost, reconnecting");
            *link = Link::open(&self.url).await?;
        }
        Ok(link)
    }
}

#[async_trait]
impl Messenger for RabbitMqMessenger {
    async fn publish(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let payload = message.encode()?;
        let link = self.link().await?;
        link.publisher
            .basic_publish(
                message.channel(),
                "",
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, SyncError> {
        let channel = self.link().await?.conn.create_channel().await?;
        declare_exchanges(&channel).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        for exchange in [INFO_CHANNEL, DELETE_CHANNEL] {
            channel
                .queue_bind(
                    queue.name().as_str(),
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "altfinder",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(queue = queue.name().as_str(), "subscribed to rabbitmq sync exchanges");

        let (tx, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            // Keeps the consuming channel open for as long as the task runs
            let _channel = channel;
            let mut deliveries = Box::pin(consumer);
            while let Some(delivery) = deliveries.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(error = %e, "rabbitmq consumer failed");
                        break;
                    }
                };
                let exchange = delivery.exchange.as_str();
                let payload = match std::str::from_utf8(&delivery.data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, exchange, "dropping non-text sync payload");
                        continue;
                    }
                };
                match SyncMessage::decode(exchange, payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, exchange, "dropping undecodable message"),
                }
            }
            debug!("rabbitmq subscription closed");
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Needs a disposable broker, e.g.
    /// `RABBITMQ_URL=amqp://127.0.0.1:5672/%2f cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_fanout_reaches_every_subscriber() {
        let Ok(url) = std::env::var("RABBITMQ_URL") else {
            return;
        };
        let messenger = RabbitMqMessenger::connect(&url).await.unwrap();
        let mut a = messenger.subscribe().await.unwrap();
        let mut b = messenger.subscribe().await.unwrap();

        let message = SyncMessage::Delete {
            key: "198.51.100.2".to_string(),
        };
        messenger.publish(&message).await.unwrap();

        for subscription in [&mut a, &mut b] {
            let received = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
                .await
                .unwrap();
            assert_eq!(received.as_ref(), Some(&message));
        }
    }
}
