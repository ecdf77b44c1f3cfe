use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::require_api_key,
    handlers::{claim_secret, health, peek_secret, revoke_secret, store_secret},
    ratelimit::{RateLimiter, RatePolicy},
    service::{ExchangePolicy, ExchangeService},
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token guarding revocation ($HANDOFF_API_KEY). Unset = open.
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub max_payload_bytes: usize,
    pub id_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let policy = ExchangePolicy::default();
        Self {
            host: std::env::var("HANDOFF_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("HANDOFF_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            api_key: std::env::var("HANDOFF_API_KEY").ok(),
            data_dir: std::env::var("HANDOFF_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(
                std::env::var("HANDOFF_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            cors_origins: std::env::var("HANDOFF_CORS_ORIGINS").ok(),
            max_payload_bytes: std::env::var("HANDOFF_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(policy.max_payload_bytes),
            id_length: std::env::var("HANDOFF_ID_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(policy.id_length),
        }
    }
}

/// Resolve the data directory, creating it when configured explicitly.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = load_or_create_key(&data_dir)?;

    let db_path = data_dir.join("handoff.db");
    let store = Store::open(&db_path, enc_key).context("open store")?;

    let limiter = RateLimiter::new(store.database(), RatePolicy::default());

    // Background TTL eviction; expiry is also re-checked on every read.
    store
        .clone()
        .spawn_sweep(cfg.sweep_interval, limiter.clone());

    let policy = ExchangePolicy {
        max_payload_bytes: cfg.max_payload_bytes,
        id_length: cfg.id_length,
        ..ExchangePolicy::default()
    };
    let exchange = ExchangeService::new(store, limiter, policy);

    let state = AppState {
        exchange,
        api_key: cfg.api_key,
    };

    let cors = build_cors(cfg.cors_origins.as_deref());

    // Public routes: senders store, recipients claim/peek. Admission control
    // is the rate limiter, not auth.
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets", post(store_secret))
        .route("/secrets/{id}", get(claim_secret))
        .route("/secrets/{id}/peek", get(peek_secret));

    // Revocation is for the sender; gate it behind the API key when set.
    let protected = Router::new()
        .route("/secrets/{id}", delete(revoke_secret))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    // Body limit sits above the payload cap (base64 + JSON overhead) so the
    // service's own size validation stays the authoritative rejection.
    let app = Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(cfg.max_payload_bytes * 2 + 4096))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "handoff server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn load_or_create_key(data_dir: &std::path::Path) -> Result<crate::store::crypto::EncryptionKey> {
    let key_path = data_dir.join("handoff.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read handoff.key")?;
        crate::store::crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "handoff.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crate::store::crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write handoff.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
