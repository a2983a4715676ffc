use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store & history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL when `backend = "redis"`.
    #[serde(default = "d_redis_url")]
    pub redis_url: String,

    /// Key namespace prefix for session blobs, kill-block entries, and the
    /// kill pub/sub topic.
    #[serde(default = "d_namespace")]
    pub namespace: String,

    /// What to do when the shared store is unreachable: keep serving from
    /// local state (`degrade`) or surface 503s (`fail`).
    #[serde(default)]
    pub on_partition: PartitionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: d_redis_url(),
            namespace: d_namespace(),
            on_partition: PartitionPolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionPolicy {
    #[default]
    Degrade,
    Fail,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History (session-record persistence)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// SQLite database path.
    #[serde(default = "d_db_path")]
    pub db_path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: d_db_path(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn d_namespace() -> String {
    "elida".into()
}
fn d_db_path() -> String {
    "elida-history.db".into()
}
fn d_true() -> bool {
    true
}
