//! Redis-backed coordination bus.
//!
//! Key/value traffic goes through a shared tokio connection manager;
//! every subscription gets its own pub/sub connection with a forwarding
//! task fanning messages out over a broadcast channel. Transient failures
//! are retried with bounded exponential backoff; persistent failure flips
//! the degraded flag, which disables automatic rollback downstream.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use stratus_core::{BusConfig, EventEnvelope};

use crate::{BusError, CoordinationBus, CHANNEL_CAPACITY};

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    max_retries: u32,
    retry_base_delay: Duration,
    degraded: AtomicBool,
    subscriptions: Arc<RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>>,
}

impl RedisBus {
    /// Connect to Redis using the configured host/port.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let url = config.redis_url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| BusError::Unavailable(format!("redis client: {e}")))?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| BusError::Unavailable(format!("redis connection: {e}")))?;
        info!(host = %config.redis_host, port = config.redis_port, "connected to redis bus");
        Ok(Self {
            client,
            manager,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            degraded: AtomicBool::new(false),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt)
    }

    fn record_failure(&self, operation: &str, err: &redis::RedisError) -> BusError {
        self.degraded.store(true, Ordering::SeqCst);
        error!(%operation, error = %err, "bus operation failed after retries; entering degraded mode");
        BusError::Unavailable(format!("{operation}: {err}"))
    }

    fn record_success(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("bus recovered; leaving degraded mode");
        }
    }
}

#[async_trait]
impl CoordinationBus for RedisBus {
    async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(value)?;
        let mut attempt = 0;
        loop {
            let mut conn = self.manager.clone();
            let result: redis::RedisResult<()> = match ttl {
                Some(ttl) => conn.set_ex(key, payload.as_str(), ttl.as_secs()).await,
                None => conn.set(key, payload.as_str()).await,
            };
            match result {
                Ok(()) => {
                    self.record_success();
                    return Ok(());
                }
                Err(err) if attempt < self.max_retries => {
                    warn!(%key, error = %err, attempt, "bus put failed; retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(self.record_failure("put", &err)),
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.manager.clone();
            let result: redis::RedisResult<Option<String>> = conn.get(key).await;
            match result {
                Ok(None) => {
                    self.record_success();
                    return Ok(None);
                }
                Ok(Some(payload)) => {
                    self.record_success();
                    return Ok(Some(serde_json::from_str(&payload)?));
                }
                Err(err) if attempt < self.max_retries => {
                    warn!(%key, error = %err, attempt, "bus get failed; retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(self.record_failure("get", &err)),
            }
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        let pattern = format!("{prefix}*");
        let mut attempt = 0;
        loop {
            let mut conn = self.manager.clone();
            let result: redis::RedisResult<Vec<String>> = conn.keys(pattern.as_str()).await;
            match result {
                Ok(mut keys) => {
                    self.record_success();
                    keys.sort();
                    return Ok(keys);
                }
                Err(err) if attempt < self.max_retries => {
                    warn!(%prefix, error = %err, attempt, "bus list_keys failed; retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(self.record_failure("list_keys", &err)),
            }
        }
    }

    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.manager.clone();
        // At-most-once: a lost publish is not retried into a duplicate;
        // replay readers use the KV record written alongside.
        let result: redis::RedisResult<()> = conn.publish(channel, payload).await;
        match result {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(err) => Err(self.record_failure("publish", &err)),
        }
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<EventEnvelope>, BusError> {
        {
            let subscriptions = self.subscriptions.read().await;
            if let Some(sender) = subscriptions.get(channel) {
                return Ok(sender.subscribe());
            }
        }

        let connection = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BusError::Subscription {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        let mut pubsub = connection.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscription {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.insert(channel.to_string(), sender.clone());
        }

        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = %channel_name, error = %err, "unreadable bus message");
                        continue;
                    }
                };
                match serde_json::from_str::<EventEnvelope>(&payload) {
                    Ok(envelope) => {
                        debug!(channel = %channel_name, event = %envelope.event_type, "bus event");
                        let _ = sender.send(envelope);
                    }
                    Err(err) => {
                        warn!(channel = %channel_name, error = %err, "malformed bus envelope");
                    }
                }
            }
            warn!(channel = %channel_name, "pub/sub stream ended");
        });

        Ok(receiver)
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
