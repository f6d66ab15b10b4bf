mod keys;
mod proxy;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use tether_core::config;

use crate::keys::KeySource;
use crate::web::AppState;

/// Startup attempts against the controller's JWKS endpoint.
const JWKS_FETCH_ATTEMPTS: u32 = 5;

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

#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.gateway.port = p;
    }

    // Initialize tracing (RUST_LOG wins over the configured level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();
    tracing::info!("Using config from {}", config_path.display());

    // Validate configuration semantics. The gateway never admits sessions,
    // so controller-only errors (API key) don't block startup here.
    if let Err(issues) = config.validate() {
        let has_errors = issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && !i.contains("API key"));
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

    // Validate web root exists so we don't silently serve 404
    if !std::path::Path::new(&config.gateway.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the terminal UI will not load. \
             Set gateway.web_root in the config.",
            config.gateway.web_root
        );
    }

    let store = tether_core::store::connect(&config.store)
        .await
        .map_err(|e| anyhow::anyhow!("Store unreachable beyond retry budget: {e}"))?;

    let http = reqwest::Client::new();
    let jwks_url = config.gateway.jwks_url.clone();
    let keys = KeySource::fetch(&http, &jwks_url, JWKS_FETCH_ATTEMPTS)
        .await
        .context("Failed to load verification keys")?;
    keys.spawn_refresh(
        http,
        jwks_url,
        Duration::from_secs(config.gateway.jwks_refresh_secs),
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .context("Invalid bind address")?;

    let state = Arc::new(AppState {
        config,
        store,
        keys,
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

    tracing::info!("===========================================");
    tracing::info!("  Tether WebSocket Gateway v{}", env!("CARGO_PKG_VERSION"));
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
    tracing::info!("tether-gateway shut down cleanly");

    Ok(())
}
