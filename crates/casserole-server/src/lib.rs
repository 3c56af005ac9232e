//! Wiring between the cache crates and the two HTTP surfaces the binary
//! exposes: the client-facing proxy route and the inter-peer block route.

pub mod config;
pub mod handler;
pub mod peer_tracker;

use std::sync::Arc;

use axum::{routing::get, Router};

pub use handler::AppState;

/// Builds the client-facing router: a single wildcard route backed by
/// [`handler::serve`], mirroring the original's one-mux-one-handler shape.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new().route("/{*path}", get(handler::serve)).with_state(state)
}
