//! Inter-peer HTTP surface: every peer exposes this router so the owner of
//! a block can serve it to whichever peer received the client request.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::DistributedBlockCache;

#[derive(Deserialize)]
pub struct BlockQuery {
    key: String,
}

async fn fetch_block(
    State(cache): State<Arc<DistributedBlockCache>>,
    Query(query): Query<BlockQuery>,
) -> Response {
    match cache.get_local(&query.key).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => {
            tracing::warn!(key = %query.key, error = %e, "peer block fetch failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Router to mount on every node's inter-peer listener (distinct from the
/// client-facing HTTP surface).
pub fn router(cache: Arc<DistributedBlockCache>) -> Router {
    Router::new().route("/_internal/block", get(fetch_block)).with_state(cache)
}
