//! Backend selection.
//!
//! Priority order: `X-Backend` header override (unknown names fall
//! through), `model` field glob match, URL path prefix, then the default
//! backend. Each backend owns its own outbound connection pool.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use elida_domain::config::BackendConfig;
use elida_domain::error::{Error, Result};

pub const BACKEND_HEADER: &str = "x-backend";

/// One configured upstream with its own reqwest client (connection pool,
/// dial and read deadlines).
#[derive(Debug)]
pub struct Backend {
    pub config: BackendConfig,
    pub client: reqwest::Client,
}

impl Backend {
    fn from_config(config: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("backend {}: building client: {e}", config.name)))?;
        Ok(Self { config, client })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Path to forward upstream: the backend's claimed prefix is stripped.
    pub fn forwarded_path<'a>(&self, path: &'a str) -> &'a str {
        match &self.config.path_prefix {
            Some(prefix) => {
                let stripped = path.strip_prefix(prefix.as_str()).unwrap_or(path);
                if stripped.is_empty() {
                    "/"
                } else {
                    stripped
                }
            }
            None => path,
        }
    }
}

#[derive(Debug)]
pub struct BackendRouter {
    backends: Vec<Arc<Backend>>,
    default: Option<Arc<Backend>>,
}

impl BackendRouter {
    pub fn from_config(configs: &[BackendConfig]) -> Result<Self> {
        let backends = configs
            .iter()
            .cloned()
            .map(Backend::from_config)
            .map(|r| r.map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let default = backends.iter().find(|b| b.config.default).cloned().or_else(|| {
            // A lone backend is its own default.
            (backends.len() == 1).then(|| backends[0].clone())
        });

        if backends.len() > 1 && default.is_none() {
            return Err(Error::Config(
                "multiple backends configured but none is marked default".into(),
            ));
        }

        Ok(Self { backends, default })
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends
            .iter()
            .find(|b| b.config.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Select a backend for a request.
    pub fn select(
        &self,
        headers: &HeaderMap,
        path: &str,
        model: Option<&str>,
    ) -> Option<Arc<Backend>> {
        // 1. Header override. Unknown names fall through.
        if let Some(name) = headers.get(BACKEND_HEADER).and_then(|v| v.to_str().ok()) {
            if let Some(backend) = self.by_name(name) {
                return Some(backend);
            }
        }

        // 2. Model glob match, first match wins.
        if let Some(model) = model {
            for backend in &self.backends {
                if backend
                    .config
                    .model_patterns
                    .iter()
                    .any(|p| glob_match(p, model))
                {
                    return Some(backend.clone());
                }
            }
        }

        // 3. Path prefix.
        for backend in &self.backends {
            if let Some(prefix) = &backend.config.path_prefix {
                if path.starts_with(prefix.as_str()) {
                    return Some(backend.clone());
                }
            }
        }

        // 4. Default.
        self.default.clone()
    }
}

/// Case-insensitive glob where `*` (the only wildcard) matches any run of
/// characters.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let value = value.to_ascii_lowercase();

    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut rest = value.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix.
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            // Anchored suffix.
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
