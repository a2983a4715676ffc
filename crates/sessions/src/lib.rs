//! Session layer: identity derivation, lifecycle (active / killed /
//! resumed / terminated / timed-out), kill-block policy, pluggable
//! persistence, and session-record emission.

pub mod kill_block;
pub mod manager;
pub mod redis_store;
pub mod session;
pub mod sink;
pub mod store;

pub use kill_block::KillBlockEntry;
pub use manager::{derive_identity, SessionManager};
pub use redis_store::RedisSessionStore;
pub use session::{KillSignal, Session, SessionHandle, SessionState};
pub use sink::{FanoutSink, SessionRecordSink, TraceRecordSink};
pub use store::{MemorySessionStore, SessionStore};
