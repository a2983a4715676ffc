//! Pluggable session persistence.
//!
//! The manager owns the authoritative in-memory map; the store is a side
//! index by id, written through on every lifecycle transition. The kill
//! pub/sub fan-out delivers ids, not state — receivers reload from the
//! store (cycle-free by construction).

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use elida_domain::error::Result;

use crate::kill_block::KillBlockEntry;
use crate::session::Session;

/// Capacity of the kill fan-out channel. Kills are rare; a small buffer
/// only has to absorb bursts between receiver polls.
const KILL_CHANNEL_CAPACITY: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: &Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Session>>;
    async fn count(&self) -> Result<usize>;

    /// Kill-block entries persist alongside sessions so a process restart
    /// observes the same embargoes.
    async fn put_block(&self, entry: &KillBlockEntry) -> Result<()>;
    async fn get_block(&self, identity: &str) -> Result<Option<KillBlockEntry>>;
    async fn delete_block(&self, identity: &str) -> Result<()>;

    /// Cross-instance kill fan-out. Publishing delivers the session id to
    /// every subscriber, including the local one.
    async fn publish_kill(&self, id: &str) -> Result<()>;
    fn subscribe_kills(&self) -> broadcast::Receiver<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process-local store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-process map store. Kill fan-out loops back over a broadcast channel
/// so single-instance deployments exercise the same code path as shared
/// deployments.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    blocks: RwLock<HashMap<String, KillBlockEntry>>,
    kills: broadcast::Sender<String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        let (kills, _) = broadcast::channel(KILL_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            kills,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.write().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.sessions.read().len())
    }

    async fn put_block(&self, entry: &KillBlockEntry) -> Result<()> {
        self.blocks
            .write()
            .insert(entry.identity.clone(), entry.clone());
        Ok(())
    }

    async fn get_block(&self, identity: &str) -> Result<Option<KillBlockEntry>> {
        Ok(self.blocks.read().get(identity).cloned())
    }

    async fn delete_block(&self, identity: &str) -> Result<()> {
        self.blocks.write().remove(identity);
        Ok(())
    }

    async fn publish_kill(&self, id: &str) -> Result<()> {
        // No subscribers is fine — send only fails when nobody listens.
        let _ = self.kills.send(id.to_owned());
        Ok(())
    }

    fn subscribe_kills(&self) -> broadcast::Receiver<String> {
        self.kills.subscribe()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::config::KillBlockConfig;

    fn session(id: &str) -> Session {
        Session::new(id.into(), "default".into(), "1.2.3.4:1000".into())
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = MemorySessionStore::new();
        store.put(&session("s1")).await.unwrap();
        assert!(store.get("s1").await.unwrap().is_some());
        assert_eq!(store.count().await.unwrap(), 1);
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocks_roundtrip() {
        let store = MemorySessionStore::new();
        let entry = KillBlockEntry::new("client-ff00-default", "client-ff00-default", &KillBlockConfig::default());
        store.put_block(&entry).await.unwrap();
        assert!(store.get_block("client-ff00-default").await.unwrap().is_some());
        store.delete_block("client-ff00-default").await.unwrap();
        assert!(store.get_block("client-ff00-default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = MemorySessionStore::new();
        let mut rx = store.subscribe_kills();
        store.publish_kill("s1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "s1");
    }
}
