pub mod auth;
pub mod dirs;
pub mod handlers;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<store::Manager<store::Backend>>,
    /// Optional API key guarding secret creation and pruning.
    pub api_key: Option<String>,
    /// TTL applied when a create request names none.
    pub default_ttl_seconds: i64,
    pub max_secret_bytes: usize,
}

pub use server::{read_key_file, router, run, ServerConfig, StorageKind};
