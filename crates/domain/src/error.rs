/// Shared error type used across all ELIDA crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Session exists but is killed, terminated, or kill-blocked.
    /// Surfaced to clients as 403 with a JSON reason.
    #[error("session forbidden: {reason} (session {session_id})")]
    SessionForbidden { session_id: String, reason: String },

    /// A policy rule with a `block` or `terminate` action matched.
    #[error("policy violation: rule {rule}")]
    PolicyBlock { rule: String },

    /// Backend dial refused or timed out. The session stays Active.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Malformed framing from the backend; the forwarder truncates and
    /// continues, the session is flagged.
    #[error("backend protocol: {0}")]
    BackendProtocol(String),

    /// Shared store unreachable. Depending on configuration this degrades
    /// to local-only state or surfaces as 503.
    #[error("store partition: {0}")]
    StorePartition(String),

    /// Voice sub-session cap reached inside a WebSocket session.
    #[error("max concurrent voice sessions reached ({0})")]
    MaxConcurrentVoice(usize),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
