use std::{collections::HashMap, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use casserole_core::{Orchestrator, OrchestratorConfig};
use casserole_groupcache::{DistributedBlockCache, GroupCacheConfig};
use casserole_metadata::{coordination::InMemoryCoordinationStore, SyncedMetadataCache};
use casserole_server::{build_router, handler::AppState};
use casserole_types::{
    generate_content_key, CacheContext, CacheDecision, CacheEntry, CacheOutcome, DiskStore,
    Hydrator, OriginResponse, Result,
};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use url::Url;

const BODY: &[u8] = b"the quick brown fox jumps over the lazy dog";

struct FixedOriginHydrator;

#[async_trait]
impl Hydrator for FixedOriginHydrator {
    async fn get_metadata(&self, url: &Url) -> Result<CacheOutcome> {
        if url.path().ends_with("/passthrough") {
            return Ok(CacheOutcome::NotCacheable);
        }

        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), BODY.len().to_string());
        headers.insert("accept-ranges".to_string(), "bytes".to_string());
        headers.insert("content-type".to_string(), "text/plain".to_string());
        let content_key = generate_content_key(url, &headers);
        Ok(CacheOutcome::Cached(CacheEntry {
            content_key,
            headers,
            total_size: BODY.len() as u64,
            decision: CacheDecision {
                cacheable: true,
                expiration: SystemTime::now() + std::time::Duration::from_secs(3600),
                reasons: Vec::new(),
                warnings: Vec::new(),
            },
        }))
    }

    async fn get(&self, _url: &Url, start: u64, end: u64) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&BODY[start as usize..end as usize]))
    }

    async fn force_get(&self, _url: &Url) -> Result<OriginResponse> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Ok(OriginResponse {
            status: 200,
            headers,
            body: Box::pin(futures::stream::once(async { Ok(Bytes::from(BODY)) })),
        })
    }
}

struct InMemoryDisk {
    store: parking_lot::Mutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl DiskStore for InMemoryDisk {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.store.lock().get(key).cloned())
    }
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store.lock().insert(key.to_string(), data);
        Ok(())
    }
    async fn hit(&self, _key: &str) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, key: &str) -> Result<()> {
        self.store.lock().remove(key);
        Ok(())
    }
    fn total_size(&self) -> u64 {
        self.store.lock().values().map(|v| v.len() as u64).sum()
    }
}

fn test_router() -> axum::Router {
    let hydrator = Arc::new(FixedOriginHydrator);
    let coordination = InMemoryCoordinationStore::new();
    let metadata = Arc::new(SyncedMetadataCache::new(coordination));
    let context = CacheContext {
        disk: Arc::new(InMemoryDisk { store: parking_lot::Mutex::new(HashMap::new()) }),
        hydrator: hydrator.clone(),
    };
    let group = DistributedBlockCache::new("self", context, GroupCacheConfig::default());
    let orchestrator =
        Orchestrator::new(hydrator, metadata, group, OrchestratorConfig::new(8, Vec::new()))
            .unwrap();
    let state = Arc::new(AppState {
        orchestrator,
        mirror_url: "http://origin.example".to_string(),
        block_size: 8,
    });
    build_router(state)
}

#[tokio::test]
async fn full_body_get_returns_200_with_full_content() {
    let router = test_router();
    let response = router
        .oneshot(Request::get("/object.txt").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(
        response.headers().get("content-length").unwrap(),
        &BODY.len().to_string()
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BODY);
}

#[tokio::test]
async fn single_range_get_returns_206_with_content_range() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::get("/object.txt")
                .header("range", "bytes=4-8")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        &format!("bytes 4-8/{}", BODY.len())
    );
    assert_eq!(response.headers().get("content-length").unwrap(), "5");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &BODY[4..9]);
}

#[tokio::test]
async fn multi_range_get_returns_206_multipart() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::get("/object.txt")
                .header("range", "bytes=0-3,10-13")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap().to_string();
    assert!(content_type.starts_with("multipart/byteranges; boundary="));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.windows(4).any(|w| w == &BODY[0..4]));
    assert!(body.windows(4).any(|w| w == &BODY[10..14]));
}

#[tokio::test]
async fn malformed_range_falls_back_to_full_body() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::get("/object.txt")
                .header("range", "garbage")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BODY);
}

#[tokio::test]
async fn oversized_combined_range_falls_back_to_full_body() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::get("/object.txt")
                .header("range", format!("bytes=0-{len},0-{len}", len = BODY.len() - 1))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BODY);
}

#[tokio::test]
async fn head_request_returns_headers_with_empty_body() {
    let router = test_router();
    let response = router
        .oneshot(Request::head("/object.txt").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-length").unwrap(),
        &BODY.len().to_string()
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn uncacheable_path_is_streamed_through_from_origin() {
    let router = test_router();
    let response = router
        .oneshot(Request::get("/passthrough").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BODY);
}
