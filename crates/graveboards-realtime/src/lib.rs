// SPDX-License-Identifier: GPL-3.0-or-later

//! Pub/sub bus used to announce new recurring tasks and queued work items.
//!
//! Messages are opaque identifiers (a task id or a dedupe key). Delivery is
//! best effort: subscribers must tolerate duplicates and gaps.

#[cfg(feature = "redis")]
mod redis_bus;

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[cfg(feature = "redis")]
pub use redis_bus::RedisPubSub;

/// Stream of raw message payloads from one channel.
pub type MessageStream = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,

    #[error("bus backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// Process-local bus backed by one tokio broadcast channel per name.
#[derive(Default)]
pub struct InMemoryPubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| {
            warn!(target: "realtime", "channel map mutex poisoned, recovering");
            poisoned.into_inner()
        });
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        // Publishing with no subscribers is not an error, just a dropped message.
        let receivers = self.sender(channel).send(message.to_string()).unwrap_or(0);
        debug!(target: "realtime", %channel, %message, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "realtime", %channel, skipped, "subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscriber_receives_messages_in_channel_only() {
        let bus = InMemoryPubSub::new();
        let mut tasks = bus.subscribe("score_fetcher_tasks").await.unwrap();
        let mut other = bus.subscribe("profile_fetcher_tasks").await.unwrap();

        bus.publish("score_fetcher_tasks", "7").await.unwrap();
        bus.publish("score_fetcher_tasks", "8").await.unwrap();

        assert_eq!(tasks.next().await.as_deref(), Some("7"));
        assert_eq!(tasks.next().await.as_deref(), Some("8"));

        let nothing = tokio::time::timeout(Duration::from_millis(20), other.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryPubSub::new();
        assert!(bus.publish("nobody", "1").await.is_ok());
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = InMemoryPubSub::new();
        let mut a = bus.subscribe("c").await.unwrap();
        let mut b = bus.subscribe("c").await.unwrap();

        bus.publish("c", "hello").await.unwrap();

        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));
    }
}
