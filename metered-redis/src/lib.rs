//! Redis backends for `metered-core`: a [`SharedCache`] for cluster-wide
//! sliding windows and reminder dedup, and a [`PubSub`] for config
//! invalidation across nodes.
//!
//! Both share one [`ConnectionManager`], which reconnects on its own.
//! Subscriptions open a dedicated connection per channel.

use async_trait::async_trait;
use futures::StreamExt;
use metered_core::cache::{SharedCache, WindowCount};
use metered_core::error::StoreError;
use metered_core::pubsub::{MessageStream, PubSub};
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings.
#[derive(Deserialize, Clone, Debug)]
pub struct RedisConfig {
    pub hostname: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database index.
    pub db: Option<u32>,
}

impl std::fmt::Display for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Hostname: {} | Port: {} | Username: {} | Password: {}",
            self.hostname,
            self.port.unwrap_or(6379),
            self.username.as_deref().unwrap_or("NA"),
            if self.password.is_some() { "********" } else { "[password not set]" },
        )
    }
}

impl RedisConfig {
    /// Build a full Redis connection string from its parts.
    pub fn build_connection_string(&self) -> String {
        let hostname = self.hostname.strip_prefix("redis://").unwrap_or(&self.hostname);
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        let username = self.username.clone().unwrap_or_default();
        let password = self.password.as_ref().map(|p| format!(":{p}")).unwrap_or_default();
        let at = if username.is_empty() && password.is_empty() { "" } else { "@" };
        let db = self.db.map(|d| format!("/{d}")).unwrap_or_default();
        format!("redis://{username}{password}{at}{hostname}{port}{db}")
    }
}

fn map_err(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Open a client and its connection manager.
pub async fn connect(
    config: &RedisConfig,
) -> Result<(redis::Client, ConnectionManager), StoreError> {
    let client = redis::Client::open(config.build_connection_string())
        .map_err(|e| StoreError::Backend(format!("could not create redis client: {e}")))?;
    let manager = client.get_connection_manager().await.map_err(map_err)?;
    debug!(target: "metered::redis", host = %config.hostname, "redis connected");
    Ok((client, manager))
}

/// Sliding windows as sorted sets scored by hit time; flags as `SET NX PX`.
#[derive(Clone)]
pub struct RedisCache {
    connection_manager: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl RedisCache {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager, prefix: String::new() }
    }

    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let (_, manager) = connect(config).await?;
        Ok(Self::new(manager))
    }

    /// Namespace every key, e.g. `"autoads:"`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

/// Members are `"{hit_ms}-{uuid}"` so equal timestamps stay distinct.
fn member_time(member: &str) -> Option<u64> {
    member.split_once('-').and_then(|(ms, _)| ms.parse().ok())
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let key = self.key(key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let floor = now_ms.saturating_sub(window_ms);
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let mut connection = self.connection_manager.clone();
        let (count, oldest): (u64, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(floor)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(0)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .ignore()
            .query_async(&mut connection)
            .await
            .map_err(map_err)?;
        Ok(WindowCount { count, oldest_ms: oldest.first().and_then(|m| member_time(m)) })
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut connection = self.connection_manager.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(map_err)?;
        Ok(created.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection_manager.clone();
        let () = connection.del(self.key(key)).await.map_err(map_err)?;
        Ok(())
    }
}

/// Redis PUBLISH / SUBSCRIBE.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub").finish_non_exhaustive()
    }
}

impl RedisPubSub {
    pub fn new(client: redis::Client, connection_manager: ConnectionManager) -> Self {
        Self { client, connection_manager }
    }

    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let (client, manager) = connect(config).await?;
        Ok(Self::new(client, manager))
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut connection = self.connection_manager.clone();
        let receivers: i64 = connection.publish(channel, payload).await.map_err(map_err)?;
        debug!(target: "metered::redis", channel, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.subscribe(channel).await.map_err(map_err)?;
        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(
                        target: "metered::redis",
                        channel = %channel,
                        error = %e,
                        "dropping non-utf8 message"
                    );
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(stream.boxed())
    }
}
