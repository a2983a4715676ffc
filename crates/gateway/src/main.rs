use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::Router;
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};

use elida_capture::CaptureBuffer;
use elida_domain::config::{Config, ConfigSeverity, StoreBackend};
use elida_gateway::api;
use elida_gateway::cli::{self, Cli, Command, ConfigCommand};
use elida_gateway::events::EventLog;
use elida_gateway::forward;
use elida_gateway::history::{HistoryRecordSink, HistoryStore};
use elida_gateway::router::BackendRouter;
use elida_gateway::sinks::EnrichingSink;
use elida_gateway::state::AppState;
use elida_gateway::telemetry;
use elida_gateway::voice::{SessionControlParser, VoiceRegistry};
use elida_policy::PolicyEngine;
use elida_sessions::{
    FanoutSink, MemorySessionStore, RedisSessionStore, SessionManager, SessionRecordSink,
    SessionStore, TraceRecordSink,
};

/// Bounded event-log capacity.
const EVENT_LOG_CAPACITY: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let (config, _config_path) = cli::load_config()?;
            telemetry::init(&config.observability)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("elida {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Start the proxy with the given configuration.
///
/// Construction is deterministic, leaves first: history/capture/policy →
/// session store → manager → router → forwarders. Teardown is implicit
/// in reverse via Drop.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("ELIDA starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Capture buffer ───────────────────────────────────────────────
    let capture = Arc::new(CaptureBuffer::new(&config.capture));
    tracing::info!(
        max_body_bytes = config.capture.max_body_bytes,
        max_entries = config.capture.max_entries_per_session,
        "capture buffer ready"
    );

    // ── Policy engine (rules compile here; failure aborts startup) ──
    let policy = if config.policy.enabled && !config.policy.rules.is_empty() {
        Some(
            PolicyEngine::new(&config.policy, config.capture.max_entries_per_session)
                .context("compiling policy rules")?,
        )
    } else {
        tracing::info!("policy engine disabled (no rules or not enabled)");
        None
    };

    // ── Event log ────────────────────────────────────────────────────
    let events = Arc::new(EventLog::new(EVENT_LOG_CAPACITY));

    // ── History store ────────────────────────────────────────────────
    let history = if config.history.enabled {
        Some(Arc::new(
            HistoryStore::open(&config.history.db_path).context("opening history store")?,
        ))
    } else {
        tracing::info!("history store disabled");
        None
    };

    // ── Record sinks: trace + history, enriched with captures ───────
    let mut sinks: Vec<Arc<dyn SessionRecordSink>> = vec![Arc::new(TraceRecordSink)];
    if let Some(history) = &history {
        sinks.push(Arc::new(HistoryRecordSink::new(history.clone())));
    }
    let sink: Arc<dyn SessionRecordSink> = Arc::new(EnrichingSink::new(
        capture.clone(),
        policy.clone(),
        events.clone(),
        Arc::new(FanoutSink::new(sinks)),
    ));

    // ── Session store ────────────────────────────────────────────────
    let store: Arc<dyn SessionStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
        StoreBackend::Redis => Arc::new(
            RedisSessionStore::connect(&config.store, config.sessions.retention_secs)
                .await
                .context("connecting to redis session store")?,
        ),
    };

    // ── Session manager ──────────────────────────────────────────────
    let manager = SessionManager::new(store, sink, config.sessions.clone());
    tracing::info!(
        idle_timeout_secs = config.sessions.idle_timeout_secs,
        resume_window_secs = config.sessions.resume_window_secs,
        kill_block_mode = %config.sessions.kill_block.mode,
        "session manager ready"
    );

    // ── Backend router ───────────────────────────────────────────────
    let router = Arc::new(
        BackendRouter::from_config(&config.backends).context("building backend router")?,
    );
    tracing::info!(backends = config.backends.len(), "backend router ready");

    // ── Voice parser + registry ──────────────────────────────────────
    let voice_parser = Arc::new(
        SessionControlParser::new(&config.voice.custom_parsers)
            .context("compiling voice parser rules")?,
    );
    let voice = Arc::new(VoiceRegistry::new());

    // ── Control API key (read once, hash for constant-time compare) ──
    let api_key_hash = {
        let env_var = &config.control.api_key_env;
        match std::env::var(env_var) {
            Ok(key) if !key.is_empty() => {
                tracing::info!(env_var = %env_var, "control API-key auth enabled");
                Some(Sha256::digest(key.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    env_var = %env_var,
                    "control API-key auth DISABLED — set {env_var} to enable"
                );
                None
            }
        }
    };

    let state = AppState {
        config: config.clone(),
        manager: manager.clone(),
        router,
        policy: policy.clone(),
        capture: capture.clone(),
        history,
        events,
        voice,
        voice_parser,
        api_key_hash,
        started_at: chrono::Utc::now(),
    };

    // ── Sweeper (idle timeout, auto-terminate, retention, blocks) ────
    {
        let manager = manager.clone();
        let interval_secs = config.sessions.sweep_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                manager.sweep().await;
            }
        });
        tracing::info!(interval_secs, "session sweeper started");
    }

    // ── Cross-instance kill propagation ──────────────────────────────
    tokio::spawn(manager.clone().run_kill_listener());

    // ── Flagged/capture GC: drop side-table entries for dead sessions ─
    {
        let manager = manager.clone();
        let policy = policy.clone();
        let capture = capture.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Some(policy) = &policy {
                    for flagged in policy.flagged().list() {
                        if manager.get(&flagged.session_id).is_none() {
                            policy.flagged().remove(&flagged.session_id);
                            capture.remove(&flagged.session_id);
                        }
                    }
                }
            }
        });
    }

    // ── Control listener ─────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.control.cors);

    // Per-IP rate limit (token bucket via governor), when configured.
    let governor_layer = config.control.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second)
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");

        tracing::info!(
            requests_per_second = rl.requests_per_second,
            burst_size = rl.burst_size,
            "control per-IP rate limiting enabled"
        );

        GovernorLayer {
            config: std::sync::Arc::new(gov_config),
        }
    });

    let control_router = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(64));
    let control_app = if let Some(gov) = governor_layer {
        control_router.layer(gov).with_state(state.clone())
    } else {
        control_router.with_state(state.clone())
    };

    let control_addr = format!("{}:{}", config.control.host, config.control.port);
    let control_listener = tokio::net::TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("binding control listener to {control_addr}"))?;
    tracing::info!(addr = %control_addr, "control listener ready");

    // ── Ingress listener (data path; WS upgrades on the same port) ──
    let ingress_app = Router::new()
        .fallback(forward::http::ingress)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let ingress_addr = format!("{}:{}", config.ingress.host, config.ingress.port);
    let ingress_listener = tokio::net::TcpListener::bind(&ingress_addr)
        .await
        .with_context(|| format!("binding ingress listener to {ingress_addr}"))?;
    tracing::info!(addr = %ingress_addr, "ELIDA listening");

    tokio::try_join!(
        axum::serve(
            ingress_listener,
            ingress_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
        axum::serve(
            control_listener,
            control_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
    )
    .context("server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may carry a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`), expanded into a predicate matching any
/// port on that host. A literal `"*"` allows all origins (not
/// recommended for production).
fn build_cors_layer(cors: &elida_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    // Special case: if the only entry is "*", use fully permissive CORS.
    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    // Partition into exact origins and wildcard-port patterns.
    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            // e.g. "http://localhost:*" -> prefix "http://localhost:"
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            // Wildcard-port patterns: the remainder must be digits only,
            // preventing prefix-based bypass ("http://localhost:3000.evil.com").
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
