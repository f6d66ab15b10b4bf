mod admission;
mod orchestrator;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use tether_core::config::{self, TetherConfig};
use tether_core::limit::RateLimiter;
use tether_core::token::Signer;

use crate::orchestrator::KubeLauncher;
use crate::web::AppState;

/// Where a generated signing key is persisted so tokens survive restarts.
const PERSISTED_KEY_PATH: &str = "/var/lib/tether/signing_key.pem";

/// Drain window for in-flight requests after a shutdown signal.
const DRAIN_BUDGET: Duration = Duration::from_secs(30);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/tether.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Load the signing key from config, a previously persisted key, or
/// generate a fresh one and persist it.
fn load_or_create_signer(config: &TetherConfig) -> Result<Signer> {
    if let Some(ref path) = config.signing.key_file {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signing key: {path}"))?;
        return Signer::from_pem(&pem)
            .map_err(|e| anyhow::anyhow!("Unusable signing key {path}: {e}"));
    }

    let persisted = std::path::Path::new(PERSISTED_KEY_PATH);
    if let Ok(pem) = std::fs::read_to_string(persisted) {
        match Signer::from_pem(&pem) {
            Ok(signer) => {
                tracing::info!("Loaded signing key from {}", persisted.display());
                return Ok(signer);
            }
            Err(e) => {
                tracing::warn!("Persisted signing key unusable ({e}), generating a new one");
            }
        }
    }

    let (signer, pem) =
        Signer::generate().map_err(|e| anyhow::anyhow!("Signing key generation failed: {e}"))?;
    if let Err(e) = std::fs::create_dir_all("/var/lib/tether") {
        tracing::warn!("Failed to create /var/lib/tether: {e}");
    } else {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(persisted)
        {
            Ok(mut f) => {
                let _ = f.write_all(pem.as_bytes());
                tracing::info!("Persisted signing key to {}", persisted.display());
            }
            Err(e) => {
                tracing::warn!("Failed to persist signing key: {e}");
            }
        }
    }
    Ok(signer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.controller.port = p;
    }

    // Initialize tracing (RUST_LOG wins over the configured level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();
    tracing::info!("Using config from {}", config_path.display());

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let api_key = config.api_key()?;
    let signer = load_or_create_signer(&config)?;
    tracing::info!(kid = %signer.kid(), "Signing key loaded");

    let store = tether_core::store::connect(&config.store)
        .await
        .map_err(|e| anyhow::anyhow!("Store unreachable beyond retry budget: {e}"))?;

    let launcher = KubeLauncher::new(config.orchestrator.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Orchestrator client init failed: {e}"))?;

    let bind_addr: SocketAddr = format!("{}:{}", config.controller.bind, config.controller.port)
        .parse()
        .context("Invalid bind address")?;
    let rate_limit_max = config.session.rate_limit_max;
    let rate_limit_window = config.session.rate_limit_window_secs;
    let prune_interval = config.session.prune_interval_secs;

    let state = Arc::new(AppState {
        config,
        api_key,
        store,
        launcher: Arc::new(launcher),
        signer,
        limiter: RateLimiter::new(rate_limit_max, Duration::from_secs(rate_limit_window)),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // Background task: prune expired sessions and token records
    let pruner_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(prune_interval)).await;
            match pruner_state.store.prune_expired(Utc::now()).await {
                Ok((sessions, tokens)) if sessions + tokens > 0 => {
                    tracing::info!(sessions, tokens, "Pruned expired rows");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Prune pass failed: {e}");
                }
            }
        }
    });

    tracing::info!("===========================================");
    tracing::info!("  Tether Session Controller v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    // Graceful shutdown: stop accepting on SIGINT/SIGTERM, drain in-flight
    // requests up to the budget, then close the store pool exactly once.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let (drain_tx, mut drain_rx) = tokio::sync::watch::channel(false);
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        let _ = drain_tx.send(true);
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown);

    tokio::select! {
        result = server => {
            result.context("Server error")?;
        }
        _ = async {
            while !*drain_rx.borrow_and_update() {
                if drain_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(DRAIN_BUDGET).await;
        } => {
            tracing::warn!("Drain budget exceeded, closing remaining connections");
        }
    }

    state.store.close().await;
    tracing::info!("tether-controller shut down cleanly");

    Ok(())
}
