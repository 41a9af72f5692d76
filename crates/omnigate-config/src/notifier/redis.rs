//! Redis pub/sub notifier for cross-host fan-out.
//!
//! Channel layout: `omnigate:config:<tenant>` per tenant, with
//! `omnigate:config:_global` for tenantless reload-all events. The
//! subscriber pattern-subscribes to the whole prefix and reconnects with
//! backoff when the connection drops.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{ConfigEvent, Notifier, NotifierError, EVENT_CHANNEL_CAPACITY};

const CHANNEL_PREFIX: &str = "omnigate:config";
const GLOBAL_CHANNEL: &str = "omnigate:config:_global";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Notifier backed by redis `PUBLISH`/`PSUBSCRIBE`.
pub struct RedisNotifier {
    client: redis::Client,
    sender: broadcast::Sender<ConfigEvent>,
}

impl std::fmt::Debug for RedisNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNotifier").finish_non_exhaustive()
    }
}

impl RedisNotifier {
    /// Connect lazily to the given redis URL.
    pub fn new(url: &str) -> Result<Self, NotifierError> {
        let client = redis::Client::open(url)?;
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { client, sender })
    }

    /// Build from `REDIS_URL` in the environment.
    pub fn from_env() -> Result<Self, NotifierError> {
        let url = std::env::var(crate::ENV_REDIS_URL)
            .map_err(|_| NotifierError::MissingEnv(crate::ENV_REDIS_URL.to_string()))?;
        Self::new(&url)
    }

    fn channel_for(event: &ConfigEvent) -> String {
        match event.config.as_ref().map(|c| c.tenant.as_str()) {
            Some(tenant) if !tenant.is_empty() => format!("{CHANNEL_PREFIX}:{tenant}"),
            _ => GLOBAL_CHANNEL.to_string(),
        }
    }

    /// Spawn the subscriber task. Runs until the notifier is dropped and
    /// every receiver has gone away.
    pub fn start_receiving(&self) {
        let client = self.client.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            loop {
                match Self::subscribe_loop(&client, &sender).await {
                    Ok(()) => break, // all receivers dropped
                    Err(e) => {
                        tracing::warn!(error = %e, "redis subscription lost, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
    }

    async fn subscribe_loop(
        client: &redis::Client,
        sender: &broadcast::Sender<ConfigEvent>,
    ) -> Result<(), NotifierError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}:*")).await?;
        tracing::info!(pattern = %format!("{CHANNEL_PREFIX}:*"), "redis notifier subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable redis payload");
                    continue;
                }
            };
            match serde_json::from_str::<ConfigEvent>(&payload) {
                Ok(event) => {
                    if sender.send(event).is_err() {
                        // No receivers left; stop cleanly.
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed config event on redis channel");
                }
            }
        }
        Err(NotifierError::Signal("redis message stream ended".to_string()))
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    fn can_send(&self) -> bool {
        true
    }

    fn can_receive(&self) -> bool {
        true
    }

    async fn notify(&self, event: ConfigEvent) -> Result<(), NotifierError> {
        let channel = Self::channel_for(&event);
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(%channel, receivers, "published config event");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }
}
