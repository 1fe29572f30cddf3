use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware,
    routing::{delete, get, head, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    dirs,
    handlers::{
        create_secret, delete_secret, head_secret, health, list_keys, mint_key, prune_secrets,
        read_secret, revoke_key,
    },
    store::{Backend, Limits, Manager, MemoryStorage, RedbStorage},
    AppState,
};

/// Body limit for everything except secret payloads.
const JSON_BODY_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Redb,
    /// Nothing survives a restart.
    Memory,
}

impl StorageKind {
    fn from_env() -> Self {
        match std::env::var("HUSH_STORAGE").as_deref() {
            Ok("memory") => StorageKind::Memory,
            _ => StorageKind::Redb,
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub storage: StorageKind,
    pub limits: Limits,
    pub default_ttl_seconds: i64,
    pub max_secret_bytes: usize,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = Limits::default();
        Self {
            host: std::env::var("HUSH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("HUSH_PORT").unwrap_or(8080),
            api_key: std::env::var("HUSH_API_KEY").ok(),
            data_dir: std::env::var("HUSH_DATA_DIR").ok().map(PathBuf::from),
            storage: StorageKind::from_env(),
            limits: Limits {
                max_ttl_seconds: env_parse("HUSH_MAX_TTL_SECONDS")
                    .unwrap_or(defaults.max_ttl_seconds),
                max_reads: env_parse("HUSH_MAX_READS").unwrap_or(defaults.max_reads),
                max_keys_per_entry: env_parse("HUSH_MAX_KEYS_PER_ENTRY")
                    .unwrap_or(defaults.max_keys_per_entry),
            },
            default_ttl_seconds: env_parse("HUSH_DEFAULT_TTL_SECONDS").unwrap_or(86_400),
            max_secret_bytes: env_parse("HUSH_MAX_SECRET_BYTES").unwrap_or(1_048_576),
            sweep_interval: Duration::from_secs(
                env_parse("HUSH_SWEEP_INTERVAL_SECONDS").unwrap_or(300),
            ),
            cors_origins: std::env::var("HUSH_CORS_ORIGINS").ok(),
        }
    }
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the API key from `HUSH_API_KEY_FILE` (preferred) or the value
/// already in the config. File delivery keeps the key out of `/proc`.
pub fn resolve_api_key(configured: Option<String>) -> Result<Option<String>> {
    if let Ok(path) = std::env::var("HUSH_API_KEY_FILE") {
        let key = read_key_file(std::path::Path::new(&path))?;
        if configured.is_some() {
            warn!("both HUSH_API_KEY and HUSH_API_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    Ok(configured)
}

fn open_backend(cfg: &ServerConfig) -> Result<Backend> {
    match cfg.storage {
        StorageKind::Memory => {
            warn!("using in-memory storage; secrets will not survive a restart");
            Ok(MemoryStorage::new().into())
        }
        StorageKind::Redb => {
            let path = dirs::db_path(cfg.data_dir.as_deref())?;
            info!(path = %path.display(), "opening store");
            let storage = RedbStorage::open(&path).context("open store")?;
            Ok(storage.into())
        }
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let backend = open_backend(&cfg)?;
    let manager = Arc::new(Manager::new(backend, cfg.limits));

    spawn_sweep(Arc::clone(&manager), cfg.sweep_interval);

    let state = AppState {
        manager,
        api_key: resolve_api_key(cfg.api_key.clone())?,
        default_ttl_seconds: cfg.default_ttl_seconds,
        max_secret_bytes: cfg.max_secret_bytes,
    };
    if state.api_key.is_none() {
        info!("no API key configured; anyone can create secrets");
    }

    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hush server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

/// Build the HTTP router around `state`.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let cors = build_cors(cors_origins);
    let secret_limit = DefaultBodyLimit::max(state.max_secret_bytes);

    // Readers and owners authenticate with the key or delete token itself.
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets/{id}", head(head_secret))
        .route("/secrets/{id}", delete(delete_secret))
        .route("/secrets/{id}/keys", get(list_keys))
        .route("/secrets/{id}/keys", post(mint_key))
        .route("/secrets/{id}/keys/{key_id}", delete(revoke_key))
        .route("/secrets/{id}/{key}", get(read_secret));

    // Protected routes (API key required if configured).
    let protected = Router::new()
        .route("/secrets", post(create_secret).layer(secret_limit))
        .route("/prune", post(prune_secrets))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Periodically remove expired and exhausted rows. The sweep itself is
/// blocking storage work, so it runs off the async workers.
pub fn spawn_sweep(manager: Arc<Manager<Backend>>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let manager = Arc::clone(&manager);
            match tokio::task::spawn_blocking(move || manager.delete_expired()).await {
                Ok(Ok(_report)) => {}
                Ok(Err(e)) => warn!(error = %e, "sweep failed"),
                Err(e) => warn!(error = %e, "sweep task panicked"),
            }
        }
    });
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.key");
        std::fs::write(&path, "  s3cret\n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), "s3cret");

        std::fs::write(&path, "\n\t ").unwrap();
        assert!(read_key_file(&path).is_err());
    }
}
