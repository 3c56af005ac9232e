//! Client-facing HTTP surface: the single `GET|HEAD /{path}` route
//! described in spec.md §6, backed by the orchestrator.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use casserole_core::{effective_ranges, parse_range, ByteRange, LazyRangeReader, Orchestrator};
use casserole_types::CacheOutcome;
use futures::StreamExt;
use url::Url;

const CACHE_SERVER_HEADER: &str = "casserole/0.0.1";

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub mirror_url: String,
    pub block_size: u64,
}

impl AppState {
    /// Joins the client's request path onto the configured mirror root,
    /// producing the absolute URL that identifies the object everywhere
    /// downstream (content key, metadata cache key, distributed cache key).
    fn object_url(&self, path: &str) -> Result<Url, url::ParseError> {
        let joined =
            format!("{}/{}", self.mirror_url.trim_end_matches('/'), path.trim_start_matches('/'));
        Url::parse(&joined)
    }
}

/// `GET /{*path}` and `HEAD /{*path}`: the proxy's only client-visible route.
pub async fn serve(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let url = match state.object_url(&path) {
        Ok(url) => url,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let outcome = match state.orchestrator.get_metadata(&url).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "metadata lookup failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    match outcome {
        CacheOutcome::NotCacheable | CacheOutcome::Chunked => passthrough(&state, &url).await,
        CacheOutcome::Cached(entry) => {
            let reader = state.orchestrator.get(&url, &entry);
            let range_header = headers.get(http::header::RANGE).and_then(|v| v.to_str().ok());
            let ranges = match effective_ranges(range_header, entry.total_size) {
                Ok(ranges) => ranges,
                Err(_) => {
                    tracing::warn!(url = %url, "invalid range");
                    // Mirrors the original handler: a malformed `Range`
                    // header is logged and otherwise ignored, falling back
                    // to the full body rather than failing the request.
                    Vec::new()
                }
            };

            build_response(method, &entry.headers, entry.total_size, reader, state.block_size, ranges)
                .await
        }
    }
}

/// Streams an uncacheable or chunked response straight from the origin,
/// used when `get_metadata` returned `NotCacheable`/`Chunked`.
async fn passthrough(state: &Arc<AppState>, url: &Url) -> Response {
    let origin = match state.orchestrator.force_get(url).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "passthrough fetch failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(origin.status).unwrap_or(StatusCode::OK))
        .header("X-Cache-Server", CACHE_SERVER_HEADER);
    for (name, value) in &origin.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value))
        {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(origin.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Builds the cached-path response: common headers always present, then
/// either a full 200, a single-range 206, or a multipart/byteranges 206,
/// depending on `ranges`.
async fn build_response(
    method: Method,
    origin_headers: &std::collections::HashMap<String, String>,
    total_size: u64,
    reader: Arc<dyn casserole_core::SizeReaderAt>,
    block_size: u64,
    ranges: Vec<ByteRange>,
) -> Response {
    let mut builder = Response::builder()
        .header("Accept-Ranges", "bytes")
        .header("X-Cache-Server", CACHE_SERVER_HEADER);
    for (name, value) in origin_headers {
        // Header values are forwarded verbatim; the original's space-to-`+`
        // rewrite of Last-Modified/X-Cache-Date-Retrieved is not carried
        // forward (REDESIGN FLAGS: preserve headers verbatim). `Content-Length`,
        // `Content-Range`, and `Accept-Ranges` are excluded here: the branch
        // below sets its own, range-correct values, and `header()` appends
        // rather than replaces, so letting the origin's (whole-object)
        // `Content-Length` through first would leave it as the
        // first-serialized, client-visible value ahead of the real one.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("content-range")
            || name.eq_ignore_ascii_case("accept-ranges")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value))
        {
            builder = builder.header(name, value);
        }
    }

    if method == Method::HEAD {
        return builder
            .header("Content-Length", total_size.to_string())
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    match ranges.as_slice() {
        [] => {
            let stream = LazyRangeReader::stream_range(reader, 0, total_size, block_size)
                .map(|r| r.map_err(std::io::Error::other));
            builder
                .header("Content-Length", total_size.to_string())
                .status(StatusCode::OK)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        [range] => {
            let stream =
                LazyRangeReader::stream_range(reader, range.start, range.len(), block_size)
                    .map(|r| r.map_err(std::io::Error::other));
            builder
                .header("Content-Length", range.len().to_string())
                .header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", range.start, range.end.saturating_sub(1), total_size),
                )
                .status(StatusCode::PARTIAL_CONTENT)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        _ => {
            // Multiple ranges: served as a single multipart/byteranges body,
            // matching net/http's ServeContent. Parts are small enough in
            // practice (individual byte ranges) to buffer rather than stream.
            let content_type = origin_headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            const BOUNDARY: &str = "CASSEROLE-BYTERANGES-BOUNDARY";

            let mut body = Vec::new();
            for range in &ranges {
                let chunk = match reader.read_at(range.start, range.len()).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read range part");
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                };
                body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
                body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
                body.extend_from_slice(
                    format!(
                        "Content-Range: bytes {}-{}/{}\r\n\r\n",
                        range.start,
                        range.end.saturating_sub(1),
                        total_size
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&chunk);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

            builder
                .header("Content-Type", format!("multipart/byteranges; boundary={BOUNDARY}"))
                .header("Content-Length", body.len().to_string())
                .status(StatusCode::PARTIAL_CONTENT)
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_range_header() {
        let ranges = parse_range(Some("bytes=0-9"), 100).unwrap();
        assert_eq!(ranges.len(), 1);
    }
}
