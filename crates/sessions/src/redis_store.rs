//! Shared key-value session store backed by Redis.
//!
//! Each session is a serialized blob under `<ns>:session:<id>` with a TTL
//! equal to the configured retention; kill-block entries live under
//! `<ns>:block:<identity>`. Kills fan out over the `<ns>:kills` pub/sub
//! topic so peer instances can fire their local kill notification.
//!
//! When the store is unreachable, behavior follows the configured
//! partition policy: `degrade` warn-logs and serves local-only state,
//! `fail` surfaces `StorePartition` to the caller.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use elida_domain::config::{PartitionPolicy, StoreConfig};
use elida_domain::error::{Error, Result};
use elida_domain::trace::TraceEvent;

use crate::kill_block::KillBlockEntry;
use crate::session::Session;
use crate::store::SessionStore;

const KILL_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_DELAY_SECS: u64 = 5;

pub struct RedisSessionStore {
    conn: ConnectionManager,
    namespace: String,
    ttl_secs: u64,
    on_partition: PartitionPolicy,
    kills: broadcast::Sender<String>,
}

impl RedisSessionStore {
    /// Connect and start the kill pub/sub listener. Fails fast when the
    /// initial connection cannot be established (configuration error
    /// territory — the operator pointed us at a dead store).
    pub async fn connect(config: &StoreConfig, retention_secs: u64) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| Error::Config(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::StorePartition(format!("redis connect: {e}")))?;

        let (kills, _) = broadcast::channel(KILL_CHANNEL_CAPACITY);
        let topic = format!("{}:kills", config.namespace);
        tokio::spawn(kill_listener(client, topic, kills.clone()));

        tracing::info!(url = %config.redis_url, namespace = %config.namespace, "redis session store ready");

        Ok(Self {
            conn,
            namespace: config.namespace.clone(),
            ttl_secs: retention_secs,
            on_partition: config.on_partition,
            kills,
        })
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:session:{}", self.namespace, id)
    }

    fn block_key(&self, identity: &str) -> String {
        format!("{}:block:{}", self.namespace, identity)
    }

    fn kills_topic(&self) -> String {
        format!("{}:kills", self.namespace)
    }

    /// Apply the partition policy to a failed store operation.
    fn partition(&self, op: &str, e: redis::RedisError) -> Result<()> {
        match self.on_partition {
            PartitionPolicy::Degrade => {
                tracing::warn!(op, error = %e, "shared store unreachable — degrading to local state");
                TraceEvent::StoreDegraded {
                    error: e.to_string(),
                }
                .emit();
                Ok(())
            }
            PartitionPolicy::Fail => Err(Error::StorePartition(format!("{op}: {e}"))),
        }
    }
}

/// Background pub/sub loop. Reconnects with a fixed delay when the
/// subscription drops; forwards payloads (session ids) into the local
/// broadcast channel.
async fn kill_listener(client: redis::Client, topic: String, tx: broadcast::Sender<String>) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "kill pub/sub connect failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
        };
        if let Err(e) = pubsub.subscribe(&topic).await {
            tracing::warn!(error = %e, topic = %topic, "kill pub/sub subscribe failed, retrying");
            tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            continue;
        }
        tracing::debug!(topic = %topic, "kill pub/sub subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(id) => {
                    let _ = tx.send(id);
                }
                Err(e) => tracing::warn!(error = %e, "malformed kill payload"),
            }
        }
        tracing::warn!(topic = %topic, "kill pub/sub stream ended, reconnecting");
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, session: &Session) -> Result<()> {
        let blob = serde_json::to_string(session)?;
        let mut conn = self.conn.clone();
        match conn
            .set_ex::<_, _, ()>(self.session_key(&session.id), blob, self.ttl_secs)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.partition("put", e),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(self.session_key(id)).await {
            Ok(Some(blob)) => Ok(serde_json::from_str(&blob).ok()),
            Ok(None) => Ok(None),
            Err(e) => self.partition("get", e).map(|_| None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn.del::<_, ()>(self.session_key(id)).await {
            Ok(()) => Ok(()),
            Err(e) => self.partition("delete", e),
        }
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:session:*", self.namespace);
        let keys: Vec<String> = match conn.keys(&pattern).await {
            Ok(k) => k,
            Err(e) => return self.partition("list", e).map(|_| Vec::new()),
        };
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(blob)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(session) = serde_json::from_str(&blob) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:session:*", self.namespace);
        match conn.keys::<_, Vec<String>>(&pattern).await {
            Ok(keys) => Ok(keys.len()),
            Err(e) => self.partition("count", e).map(|_| 0),
        }
    }

    async fn put_block(&self, entry: &KillBlockEntry) -> Result<()> {
        let blob = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        // Permanent blocks get the retention TTL too: "process lifetime"
        // semantics are enforced by the in-memory table; the persisted copy
        // only needs to survive a restart within retention.
        match conn
            .set_ex::<_, _, ()>(self.block_key(&entry.identity), blob, self.ttl_secs)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.partition("put_block", e),
        }
    }

    async fn get_block(&self, identity: &str) -> Result<Option<KillBlockEntry>> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(self.block_key(identity)).await {
            Ok(Some(blob)) => Ok(serde_json::from_str(&blob).ok()),
            Ok(None) => Ok(None),
            Err(e) => self.partition("get_block", e).map(|_| None),
        }
    }

    async fn delete_block(&self, identity: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn.del::<_, ()>(self.block_key(identity)).await {
            Ok(()) => Ok(()),
            Err(e) => self.partition("delete_block", e),
        }
    }

    async fn publish_kill(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn.publish::<_, _, ()>(self.kills_topic(), id).await {
            Ok(()) => Ok(()),
            Err(e) => self.partition("publish_kill", e),
        }
    }

    fn subscribe_kills(&self) -> broadcast::Receiver<String> {
        self.kills.subscribe()
    }
}
