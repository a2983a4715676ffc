use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingress listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The data-path listener agents connect to. HTTP(S) and WebSocket
/// upgrades are served on the same port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_ingress_port")]
    pub port: u16,
    /// Request bodies are buffered up to this many bytes before forwarding
    /// (model extraction, policy evaluation). Larger bodies are rejected.
    #[serde(default = "d_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Unary response bodies are read fully up to this cap for policy
    /// evaluation and token accounting.
    #[serde(default = "d_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_ingress_port(),
            max_request_bytes: d_max_request_bytes(),
            max_response_bytes: d_max_response_bytes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The operator control surface (separate TCP listener, JSON over HTTP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_control_port")]
    pub port: u16,
    /// Environment variable holding the control API key. When the env var
    /// is unset or empty, the control API is open (dev mode).
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Optional per-IP rate limit on control endpoints.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_control_port(),
            api_key_env: d_api_key_env(),
            cors: CorsConfig::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    /// Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_ingress_port() -> u16 {
    8080
}
fn d_control_port() -> u16 {
    9090
}
fn d_api_key_env() -> String {
    "ELIDA_API_KEY".into()
}
fn d_max_request_bytes() -> usize {
    10 * 1024 * 1024
}
fn d_max_response_bytes() -> usize {
    10 * 1024 * 1024
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:*".into(),
        "http://127.0.0.1:*".into(),
    ]
}
