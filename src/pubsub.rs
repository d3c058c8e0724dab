//! Pub/sub seam carrying configuration change notifications between replicas.

use crate::error::StoreError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

/// Tariff rules changed; payload is free-form.
pub const TOKEN_RULES_UPDATE: &str = "token:rules:update";
/// Plan rate-limit policies changed; payload is `{"version": u64, "plans": {...}}`.
pub const RATELIMIT_PLANS_UPDATE: &str = "ratelimit:plans:update";
/// Drop cached user plans; payload is a user id or empty for all users.
pub const USER_PLAN_INVALIDATE: &str = "user:plan:invalidate";

pub const ALL_CHANNELS: [&str; 3] =
    [TOKEN_RULES_UPDATE, RATELIMIT_PLANS_UPDATE, USER_PLAN_INVALIDATE];

/// Stream of payloads received on one channel.
pub type MessageStream = BoxStream<'static, String>;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// Messages published after this call returns.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;
}

const CHANNEL_CAPACITY: usize = 256;

/// Process-local pub/sub over tokio broadcast channels.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPubSub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.sender(channel).receiver_count()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "metered::bus", %channel, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = InMemoryPubSub::new();
        let mut a = bus.subscribe(TOKEN_RULES_UPDATE).await.unwrap();
        let mut b = bus.subscribe(TOKEN_RULES_UPDATE).await.unwrap();
        assert_eq!(bus.subscriber_count(TOKEN_RULES_UPDATE), 2);
        bus.publish(TOKEN_RULES_UPDATE, "reload").await.unwrap();
        assert_eq!(a.next().await.as_deref(), Some("reload"));
        assert_eq!(b.next().await.as_deref(), Some("reload"));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = InMemoryPubSub::new();
        let mut plans = bus.subscribe(RATELIMIT_PLANS_UPDATE).await.unwrap();
        bus.publish(USER_PLAN_INVALIDATE, "u1").await.unwrap();
        bus.publish(RATELIMIT_PLANS_UPDATE, "{}").await.unwrap();
        assert_eq!(plans.next().await.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryPubSub::new();
        assert!(bus.publish(USER_PLAN_INVALIDATE, "").await.is_ok());
    }
}
