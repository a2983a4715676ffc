use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One upstream model provider.
///
/// Requests are routed to a backend in priority order: `X-Backend` header,
/// `model` glob match, URL path prefix, then the backend marked `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable name, referenced by the `X-Backend` header and session
    /// identity derivation.
    pub name: String,
    /// Upstream base URL, e.g. `https://api.openai.com`. The WebSocket
    /// URL is derived by swapping the scheme (`https` → `wss`).
    pub url: String,
    /// URL path prefix claimed by this backend, e.g. `/openai`.
    /// The prefix is stripped before forwarding.
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Glob patterns matched against the request body's top-level `model`
    /// field. `*` is the only wildcard; matching is case-insensitive.
    #[serde(default)]
    pub model_patterns: Vec<String>,
    /// Exactly one backend must be the default when several are configured.
    #[serde(default)]
    pub default: bool,
    /// Outbound dial timeout.
    #[serde(default = "d_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Outbound read timeout. Generous by default: streaming model
    /// responses can idle between tokens.
    #[serde(default = "d_read_timeout")]
    pub read_timeout_secs: u64,
}

impl BackendConfig {
    /// Derive the WebSocket URL from the HTTP URL by swapping the scheme.
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_connect_timeout() -> u64 {
    10
}
fn d_read_timeout() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str) -> BackendConfig {
        BackendConfig {
            name: "test".into(),
            url: url.into(),
            path_prefix: None,
            model_patterns: Vec::new(),
            default: false,
            connect_timeout_secs: d_connect_timeout(),
            read_timeout_secs: d_read_timeout(),
        }
    }

    #[test]
    fn ws_url_swaps_https() {
        assert_eq!(backend("https://api.example.com/v1").ws_url(), "wss://api.example.com/v1");
    }

    #[test]
    fn ws_url_swaps_http() {
        assert_eq!(backend("http://localhost:11434").ws_url(), "ws://localhost:11434");
    }
}
