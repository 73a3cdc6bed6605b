use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use ab_domain::config::Config;
use ab_gateway::{api, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ──────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ab_gateway=debug")),
        )
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Agent Blob starting");

    // ── Config ───────────────────────────────────────────────────────
    let config_path =
        PathBuf::from(std::env::var("AB_CONFIG").unwrap_or_else(|_| "agent_blob.toml".into()));
    let config: Config = if config_path.exists() {
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
        Config::default()
    };
    let config = Arc::new(config);

    // ── Boot ─────────────────────────────────────────────────────────
    let state = bootstrap::build_app_state(config.clone(), config_path)?;
    bootstrap::spawn_background_tasks(&state);

    // ── Serve ────────────────────────────────────────────────────────
    let app = api::router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Agent Blob gateway listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}
