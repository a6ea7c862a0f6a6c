// SPDX-License-Identifier: GPL-3.0-or-later
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::{BusError, MessageStream, PubSub};

fn backend(err: redis::RedisError) -> BusError {
    BusError::Backend(err.to_string())
}

/// Redis PUBLISH/SUBSCRIBE bus. Each subscription opens its own connection.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        info!(target: "realtime", "connected to redis bus");
        Ok(Self { client, conn })
    }
}

#[async_trait::async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, message).await.map_err(backend)?;
        debug!(target: "realtime", %channel, %message, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel).await.map_err(backend)?;

        let channel = channel.to_string();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        warn!(target: "realtime", %channel, error = %err, "dropping undecodable message");
                        None
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}
