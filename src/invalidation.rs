//! Cross-node L1 invalidation over Redis pub/sub
//!
//! Evicting or clearing a cache removes the entries from the shared L2
//! directly, but every other node may still hold them in its L1. After a
//! local eviction the orchestrator publishes an [`InvalidationMessage`];
//! each node runs a [`RedisInvalidationListener`] that drops the matching
//! L1 entries. Messages carry the sender's node id so a node ignores its
//! own broadcasts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::{CacheError, Result};

/// Channel used when none is configured
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache:invalidation";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    /// One key of one cache
    Key,
    /// Every entry of one cache
    Cache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub kind: InvalidationKind,
    pub cache_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Node that published the message
    pub node_id: String,
}

impl InvalidationMessage {
    pub fn key(cache_name: &str, key: &str, node_id: &str) -> Self {
        Self {
            kind: InvalidationKind::Key,
            cache_name: cache_name.to_owned(),
            key: Some(key.to_owned()),
            node_id: node_id.to_owned(),
        }
    }

    pub fn cache(cache_name: &str, node_id: &str) -> Self {
        Self {
            kind: InvalidationKind::Cache,
            cache_name: cache_name.to_owned(),
            key: None,
            node_id: node_id.to_owned(),
        }
    }

    /// A key message must name its key; every message must name its cache
    pub fn is_valid(&self) -> bool {
        if self.cache_name.is_empty() {
            return false;
        }
        match self.kind {
            InvalidationKind::Key => self.key.as_deref().is_some_and(|k| !k.is_empty()),
            InvalidationKind::Cache => true,
        }
    }
}

/// Decode a pub/sub payload, dropping invalid messages and messages sent by
/// `own_node_id`.
pub fn decode_for_node(payload: &str, own_node_id: &str) -> Option<InvalidationMessage> {
    let message = match serde_json::from_str::<InvalidationMessage>(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to decode invalidation payload {}: {}", payload, e);
            return None;
        }
    };
    if message.node_id == own_node_id {
        trace!("Ignoring invalidation published by this node");
        return None;
    }
    if !message.is_valid() {
        warn!("Ignoring malformed invalidation message: {:?}", message);
        return None;
    }
    Some(message)
}

/// Broadcasts local evictions to other nodes
#[async_trait]
pub trait InvalidationPublisher: Send + Sync {
    async fn publish_eviction(&self, cache_name: &str, key: &str) -> Result<()>;

    async fn publish_clear(&self, cache_name: &str) -> Result<()>;
}

/// Receives invalidations published by other nodes
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    async fn on_invalidation(&self, message: InvalidationMessage);
}

/// Publishes JSON-encoded [`InvalidationMessage`]s with `PUBLISH`
#[derive(Clone)]
pub struct RedisInvalidationPublisher {
    redis: redis::aio::ConnectionManager,
    channel: String,
    node_id: String,
}

impl RedisInvalidationPublisher {
    pub fn new(
        redis: redis::aio::ConnectionManager,
        channel: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            channel: channel.into(),
            node_id: node_id.into(),
        }
    }

    async fn publish(&self, message: InvalidationMessage) -> Result<()> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(&self.channel, &payload)
            .await
            .map_err(|e| CacheError::backend("pubsub", "publish", e))?;
        debug!(
            "Cache invalidation published on channel '{}': {}",
            self.channel, payload
        );
        Ok(())
    }
}

#[async_trait]
impl InvalidationPublisher for RedisInvalidationPublisher {
    async fn publish_eviction(&self, cache_name: &str, key: &str) -> Result<()> {
        self.publish(InvalidationMessage::key(cache_name, key, &self.node_id))
            .await
    }

    async fn publish_clear(&self, cache_name: &str) -> Result<()> {
        self.publish(InvalidationMessage::cache(cache_name, &self.node_id))
            .await
    }
}

/// Background subscription feeding an [`InvalidationHandler`].
///
/// The task reconnects with exponential backoff, pings Redis periodically
/// and resubscribes when the connection is lost. It runs until
/// [`stop`](Self::stop) is called.
pub struct RedisInvalidationListener {
    shutdown_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RedisInvalidationListener {
    /// Spawn the subscription task on the current runtime
    pub fn start(
        redis_client: redis::Client,
        channel: impl Into<String>,
        node_id: impl Into<String>,
        handler: Arc<dyn InvalidationHandler>,
    ) -> Self {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Self::run(
            redis_client,
            channel.into(),
            node_id.into(),
            handler,
            Arc::clone(&shutdown_flag),
        ));

        Self {
            shutdown_flag,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn subscribe(redis_client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = redis_client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::backend("pubsub", "connect", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CacheError::backend("pubsub", "subscribe", e))?;
        debug!("Invalidation listener subscribed to channel {}", channel);
        Ok(pubsub)
    }

    async fn is_healthy(redis_client: &redis::Client) -> bool {
        match redis::aio::ConnectionManager::new(redis_client.clone()).await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Invalidation listener PING failed ({}); reconnecting", e);
                    false
                }
            },
            Err(e) => {
                warn!(
                    "Invalidation listener could not connect for health check: {}",
                    e
                );
                false
            }
        }
    }

    async fn run(
        redis_client: redis::Client,
        channel: String,
        node_id: String,
        handler: Arc<dyn InvalidationHandler>,
        shutdown_flag: Arc<AtomicBool>,
    ) {
        let mut pubsub: Option<redis::aio::PubSub> = None;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_health_check = Instant::now();

        while !shutdown_flag.load(Ordering::SeqCst) {
            if pubsub.is_none() {
                match Self::subscribe(&redis_client, &channel).await {
                    Ok(fresh) => {
                        backoff = INITIAL_BACKOFF;
                        last_health_check = Instant::now();
                        pubsub = Some(fresh);
                    }
                    Err(e) => {
                        warn!(
                            "Invalidation listener subscribe failed, retrying in {:?}: {}",
                            backoff, e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }
            let Some(active) = pubsub.as_mut() else {
                continue;
            };

            let next = tokio::time::timeout(POLL_INTERVAL, active.on_message().next()).await;
            match next {
                Ok(Some(msg)) => match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if let Some(message) = decode_for_node(&payload, &node_id) {
                            handler.on_invalidation(message).await;
                        }
                    }
                    Err(e) => warn!("Failed to read invalidation payload: {}", e),
                },
                Ok(None) => {
                    warn!("Invalidation subscription on {} closed; reconnecting", channel);
                    pubsub = None;
                    continue;
                }
                Err(_) => {}
            }

            if last_health_check.elapsed() >= HEALTH_INTERVAL {
                last_health_check = Instant::now();
                if !Self::is_healthy(&redis_client).await {
                    pubsub = None;
                }
            }
        }
        debug!("Invalidation listener on {} stopped", channel);
    }

    /// Signal the task to stop without waiting for it
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Signal the task to stop and wait until it has exited
    pub async fn stop(&self) {
        self.shutdown();
        if let Some(handle) = self.handle.lock().await.take()
            && let Err(e) = handle.await
        {
            error!("Invalidation listener task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let message = InvalidationMessage::key("users", "u1", "node-a");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "key",
                "cache_name": "users",
                "key": "u1",
                "node_id": "node-a"
            })
        );

        let clear = serde_json::to_string(&InvalidationMessage::cache("users", "node-a")).unwrap();
        assert!(!clear.contains("\"key\":"));
    }

    #[test]
    fn test_validity() {
        assert!(InvalidationMessage::key("users", "u1", "n").is_valid());
        assert!(InvalidationMessage::cache("users", "n").is_valid());
        assert!(!InvalidationMessage::key("users", "", "n").is_valid());
        assert!(!InvalidationMessage::cache("", "n").is_valid());

        let mut keyless = InvalidationMessage::key("users", "u1", "n");
        keyless.key = None;
        assert!(!keyless.is_valid());
    }

    #[test]
    fn test_decode_ignores_own_node_and_garbage() {
        let payload =
            serde_json::to_string(&InvalidationMessage::key("users", "u1", "node-a")).unwrap();

        assert!(decode_for_node(&payload, "node-a").is_none());
        let decoded = decode_for_node(&payload, "node-b").unwrap();
        assert_eq!(decoded.kind, InvalidationKind::Key);
        assert_eq!(decoded.key.as_deref(), Some("u1"));

        assert!(decode_for_node("not json", "node-b").is_none());
        assert!(decode_for_node(r#"{"kind":"key","cache_name":"users","node_id":"x"}"#, "node-b").is_none());
    }
}
