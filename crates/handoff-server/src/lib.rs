pub mod auth;
pub mod dirs;
pub mod handlers;
pub mod ident;
pub mod ratelimit;
pub mod server;
pub mod service;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub exchange: service::ExchangeService,
    /// Optional API key gating revocation.
    pub api_key: Option<String>,
}

pub use server::{resolve_data_dir, run, ServerConfig};
