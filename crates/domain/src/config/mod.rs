mod backends;
mod capture;
mod observability;
mod policy;
mod server;
mod sessions;
mod store;
mod voice;

pub use backends::*;
pub use capture::*;
pub use observability::*;
pub use policy::*;
pub use server::*;
pub use sessions::*;
pub use store::*;
pub use voice::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

fn error(field: impl Into<String>, message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        field: field.into(),
        message: message.into(),
    }
}

fn warning(field: impl Into<String>, message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Warning,
        field: field.into(),
        message: message.into(),
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good. Startup aborts on
    /// any `Error`-severity issue; malformed rule patterns fail here, not
    /// at request dispatch.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        // Listener ports must be non-zero and distinct.
        if self.ingress.port == 0 {
            issues.push(error("ingress.port", "port must be greater than 0"));
        }
        if self.control.port == 0 {
            issues.push(error("control.port", "port must be greater than 0"));
        }
        if self.ingress.port == self.control.port && self.ingress.host == self.control.host {
            issues.push(error(
                "control.port",
                "ingress and control listeners must not share an address",
            ));
        }

        // Backends.
        if self.backends.is_empty() {
            issues.push(warning("backends", "no backends configured — all requests will fail routing"));
        }
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut default_count = 0usize;
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.name.is_empty() {
                issues.push(error(format!("backends[{i}].name"), "name must not be empty"));
            }
            if !backend.url.starts_with("http://") && !backend.url.starts_with("https://") {
                issues.push(error(
                    format!("backends[{i}].url"),
                    format!("url must start with http:// or https:// (got \"{}\")", backend.url),
                ));
            }
            if !backend.name.is_empty() && !seen_names.insert(&backend.name) {
                issues.push(error(
                    format!("backends[{i}].name"),
                    format!("duplicate backend name \"{}\"", backend.name),
                ));
            }
            if backend.default {
                default_count += 1;
            }
            if let Some(prefix) = &backend.path_prefix {
                if !prefix.starts_with('/') {
                    issues.push(error(
                        format!("backends[{i}].path_prefix"),
                        format!("path prefix must start with '/' (got \"{prefix}\")"),
                    ));
                }
            }
        }
        if self.backends.len() > 1 && default_count == 0 {
            issues.push(error(
                "backends",
                "multiple backends configured but none is marked default",
            ));
        }
        if default_count > 1 {
            issues.push(error("backends", "more than one backend is marked default"));
        }

        // Policy rules: every pattern must compile (case-insensitive).
        let mut longest_pattern = 0usize;
        for (i, rule) in self.policy.rules.iter().enumerate() {
            if rule.name.is_empty() {
                issues.push(error(format!("policy.rules[{i}].name"), "rule name must not be empty"));
            }
            if rule.patterns.is_empty() {
                issues.push(warning(
                    format!("policy.rules[{i}].patterns"),
                    "rule has no patterns and will never match",
                ));
            }
            for (j, pattern) in rule.patterns.iter().enumerate() {
                longest_pattern = longest_pattern.max(pattern.len());
                if let Err(e) = regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                    issues.push(error(
                        format!("policy.rules[{i}].patterns[{j}]"),
                        format!("pattern does not compile: {e}"),
                    ));
                }
            }
        }

        // Risk ladder thresholds must be strictly increasing.
        let ladder = &self.policy.risk_ladder;
        if !(ladder.warn_at < ladder.throttle_at
            && ladder.throttle_at < ladder.block_at
            && ladder.block_at < ladder.terminate_at)
        {
            issues.push(error(
                "policy.risk_ladder",
                "thresholds must satisfy warn < throttle < block < terminate",
            ));
        }
        if ladder.throttle_rate == 0 {
            issues.push(error("policy.risk_ladder.throttle_rate", "throttle rate must be > 0"));
        }

        // Streaming overlap must cover the longest pattern, else a pattern
        // straddling a chunk boundary can be missed.
        if let Some(overlap) = self.policy.scan_overlap {
            if overlap < longest_pattern {
                issues.push(warning(
                    "policy.scan_overlap",
                    format!(
                        "overlap {overlap} is smaller than the longest pattern ({longest_pattern} bytes); \
                         cross-chunk matches may be missed"
                    ),
                ));
            }
        }

        // Session timing.
        if self.sessions.sweep_interval_secs == 0 {
            issues.push(error("sessions.sweep_interval_secs", "sweep interval must be > 0"));
        }
        if self.sessions.resume_window_secs == 0 {
            issues.push(warning(
                "sessions.resume_window_secs",
                "resume window is 0 — killed sessions are terminated on the next sweep",
            ));
        }

        // Shared store.
        if self.store.backend == StoreBackend::Redis
            && !self.store.redis_url.starts_with("redis://")
            && !self.store.redis_url.starts_with("rediss://")
        {
            issues.push(error(
                "store.redis_url",
                format!("must start with redis:// or rediss:// (got \"{}\")", self.store.redis_url),
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RuleAction, Severity};

    fn backend(name: &str, default: bool) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            url: "https://api.example.com".into(),
            path_prefix: None,
            model_patterns: Vec::new(),
            default,
            connect_timeout_secs: 10,
            read_timeout_secs: 300,
        }
    }

    #[test]
    fn default_config_is_clean() {
        let issues = Config::default().validate();
        // Only the "no backends" warning is expected.
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn multiple_backends_need_a_default() {
        let cfg = Config {
            backends: vec![backend("a", false), backend("b", false)],
            ..Default::default()
        };
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "backends"));
    }

    #[test]
    fn single_backend_needs_no_default() {
        let cfg = Config {
            backends: vec![backend("only", false)],
            ..Default::default()
        };
        assert!(!cfg.validate().iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn duplicate_backend_names_rejected() {
        let cfg = Config {
            backends: vec![backend("a", true), backend("a", false)],
            ..Default::default()
        };
        assert!(cfg.validate().iter().any(|i| i.message.contains("duplicate")));
    }

    #[test]
    fn malformed_rule_pattern_is_an_error() {
        let cfg = Config {
            policy: PolicyConfig {
                rules: vec![RuleConfig {
                    name: "bad".into(),
                    description: String::new(),
                    kind: RuleKind::ContentMatch,
                    target: RuleTarget::Both,
                    patterns: vec!["(unclosed".into()],
                    severity: Severity::Warning,
                    action: RuleAction::Flag,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("does not compile")));
    }

    #[test]
    fn non_increasing_ladder_rejected() {
        let cfg = Config {
            policy: PolicyConfig {
                risk_ladder: RiskLadderConfig {
                    warn_at: 10,
                    throttle_at: 10,
                    throttle_rate: 10,
                    block_at: 30,
                    terminate_at: 50,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().iter().any(|i| i.field == "policy.risk_ladder"));
    }

    #[test]
    fn parses_full_toml() {
        let raw = r#"
            [ingress]
            port = 8080

            [control]
            port = 9090

            [[backends]]
            name = "openai"
            url = "https://api.openai.com"
            path_prefix = "/openai"
            model_patterns = ["gpt-*"]
            default = true

            [[backends]]
            name = "local"
            url = "http://localhost:11434"
            model_patterns = ["llama*"]

            [[policy.rules]]
            name = "no-exfil"
            target = "response"
            patterns = ["BEGIN RSA PRIVATE KEY"]
            severity = "critical"
            action = "block"

            [store]
            backend = "redis"
            redis_url = "redis://localhost:6379"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.policy.rules.len(), 1);
        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert!(!cfg.validate().iter().any(|i| i.severity == ConfigSeverity::Error));
    }
}
