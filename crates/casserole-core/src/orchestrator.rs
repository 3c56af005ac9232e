//! Cache orchestrator: the component that turns "a URL and some client
//! headers" into either a cached, block-addressable reader or a verdict
//! that the request must bypass the cache entirely.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};

use casserole_types::{
    block_count, generate_content_key, CacheEntry, CacheOutcome, CasseroleError, DataRequest,
    GroupCache, Hydrator, MetadataCache, OriginResponse, Result,
};
use regex::RegexSet;
use url::Url;

use crate::reader::{BlockReaderAt, MultiReaderAt, SizeReaderAt};

/// An object is never installed into the metadata cache if it's within this
/// many seconds of expiring — avoids storing (and replicating) entries that
/// would be stale again almost immediately. Matches the original's literal
/// `60 * time.Second` constant.
const MIN_CACHEABLE_TTL: Duration = Duration::from_secs(60);

/// Counters mirroring the ambient observability the teacher's server
/// middleware carries (`CacheMetrics` in `http-cache-tower-server`):
/// free to collect, useful for dashboards, no bearing on cache correctness.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub passthroughs: AtomicU64,
}

impl CacheMetrics {
    fn record(&self, outcome: &CacheOutcome, from_cache: bool) {
        match outcome {
            CacheOutcome::Cached(_) if from_cache => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            CacheOutcome::Cached(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            CacheOutcome::NotCacheable | CacheOutcome::Chunked => {
                self.passthroughs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Tuning passed to [`Orchestrator::new`].
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Fixed block size objects are carved into; see `casserole_types::DEFAULT_BLOCK_SIZE`.
    pub block_size: u64,
    /// URLs matching any of these are never cached, mirroring the `passthrough` config list.
    pub passthrough: Vec<String>,
}

impl OrchestratorConfig {
    pub fn new(block_size: u64, passthrough: Vec<String>) -> Self {
        Self { block_size, passthrough }
    }
}

/// Combines the hydrator, metadata cache, and distributed block cache into
/// the three operations spec.md §4.5 names: `get_metadata`, `get`, and
/// `force_get`. Generic over trait objects (not concrete types) so it can
/// be exercised against fakes in tests without a running cluster.
pub struct Orchestrator {
    hydrator: Arc<dyn Hydrator>,
    metadata: Arc<dyn MetadataCache>,
    group: Arc<dyn GroupCache>,
    block_size: u64,
    passthrough: Option<RegexSet>,
    metrics: CacheMetrics,
}

impl Orchestrator {
    pub fn new(
        hydrator: Arc<dyn Hydrator>,
        metadata: Arc<dyn MetadataCache>,
        group: Arc<dyn GroupCache>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let passthrough = if config.passthrough.is_empty() {
            None
        } else {
            Some(
                RegexSet::new(&config.passthrough)
                    .map_err(|e| CasseroleError::Other(format!("invalid passthrough regex: {e}")))?,
            )
        };
        Ok(Self {
            hydrator,
            metadata,
            group,
            block_size: config.block_size,
            passthrough,
            metrics: CacheMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn is_passthrough(&self, url: &Url) -> bool {
        self.passthrough.as_ref().is_some_and(|set| set.is_match(url.as_str()))
    }

    /// Resolves caching policy for `url`: an existing cache entry, a fresh
    /// one hydrated and installed on this call, or a verdict that this
    /// request must bypass the cache.
    ///
    /// Order of checks exactly follows spec.md §4.5: passthrough regex,
    /// then the local metadata cache, then a fresh origin probe with its
    /// own three-way "reasons / imminent expiry / Accept-Ranges: none"
    /// rejection before installing.
    pub async fn get_metadata(&self, url: &Url) -> Result<CacheOutcome> {
        if self.is_passthrough(url) {
            let outcome = CacheOutcome::NotCacheable;
            self.metrics.record(&outcome, false);
            return Ok(outcome);
        }

        if let Some(entry) = self.metadata.get(url).await {
            if entry.decision.cacheable && !entry.decision.is_expired() {
                let outcome = CacheOutcome::Cached(entry);
                self.metrics.record(&outcome, true);
                return Ok(outcome);
            }
        }

        let outcome = self.hydrator.get_metadata(url).await?;
        let outcome = match outcome {
            CacheOutcome::Cached(entry) => self.accept_or_reject(url, entry).await?,
            other => other,
        };
        self.metrics.record(&outcome, false);
        Ok(outcome)
    }

    /// Applies the install-time rejection rules and, if the entry survives
    /// them, writes it into the metadata cache with a TTL derived from its
    /// expiration instant.
    async fn accept_or_reject(&self, url: &Url, entry: CacheEntry) -> Result<CacheOutcome> {
        if !entry.decision.reasons.is_empty() {
            return Ok(CacheOutcome::NotCacheable);
        }

        let now = SystemTime::now();
        let ttl = match entry.decision.expiration.duration_since(now) {
            Ok(ttl) => ttl,
            Err(_) => return Ok(CacheOutcome::NotCacheable),
        };
        if ttl < MIN_CACHEABLE_TTL {
            return Ok(CacheOutcome::NotCacheable);
        }

        if entry
            .headers
            .get("accept-ranges")
            .is_some_and(|v| v.eq_ignore_ascii_case("none"))
        {
            return Ok(CacheOutcome::NotCacheable);
        }

        self.metadata.add(url, entry.clone(), ttl.as_secs()).await?;
        Ok(CacheOutcome::Cached(entry))
    }

    /// Builds the composed, randomly addressable reader for a cached
    /// object: one [`BlockReaderAt`] per block of the content-addressed
    /// object, stitched together by [`MultiReaderAt`].
    pub fn get(&self, url: &Url, entry: &CacheEntry) -> Arc<dyn SizeReaderAt> {
        let content_key = generate_content_key(url, &entry.headers);
        let blocks = block_count(entry.total_size, self.block_size);
        let parts: Vec<Arc<dyn SizeReaderAt>> = (0..blocks)
            .map(|i| {
                let request = DataRequest {
                    url: url.clone(),
                    content_key: content_key.clone(),
                    block: i,
                    total_size: entry.total_size,
                    block_size: self.block_size,
                };
                Arc::new(BlockReaderAt::new(self.group.clone(), request)) as Arc<dyn SizeReaderAt>
            })
            .collect();

        Arc::new(MultiReaderAt::new(parts))
    }

    /// Pure passthrough to the hydrator, used whenever `get_metadata`
    /// returned `NotCacheable` or `Chunked`.
    pub async fn force_get(&self, url: &Url) -> Result<OriginResponse> {
        self.hydrator.force_get(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use casserole_types::CacheDecision;
    use std::collections::HashMap;

    struct FakeHydrator {
        outcome: CacheOutcome,
    }

    #[async_trait]
    impl Hydrator for FakeHydrator {
        async fn get_metadata(&self, _url: &Url) -> Result<CacheOutcome> {
            Ok(match &self.outcome {
                CacheOutcome::Cached(e) => CacheOutcome::Cached(e.clone()),
                CacheOutcome::NotCacheable => CacheOutcome::NotCacheable,
                CacheOutcome::Chunked => CacheOutcome::Chunked,
            })
        }
        async fn get(&self, _url: &Url, start: u64, end: u64) -> Result<Bytes> {
            Ok(Bytes::from(vec![b'x'; (end - start) as usize]))
        }
        async fn force_get(&self, _url: &Url) -> Result<OriginResponse> {
            Ok(OriginResponse { status: 200, headers: HashMap::new(), body: Box::pin(futures::stream::empty()) })
        }
    }

    struct NullMetadataCache;

    #[async_trait]
    impl MetadataCache for NullMetadataCache {
        async fn get(&self, _url: &Url) -> Option<CacheEntry> {
            None
        }
        async fn add(&self, _url: &Url, _entry: CacheEntry, _ttl_secs: u64) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _url: &Url) -> Result<()> {
            Ok(())
        }
    }

    struct NullGroupCache;

    #[async_trait]
    impl GroupCache for NullGroupCache {
        async fn get(&self, key: &str) -> Result<Bytes> {
            let req = DataRequest::from_cache_key(key).unwrap();
            let (start, end) = req.range();
            Ok(Bytes::from(vec![b'x'; (end - start) as usize]))
        }
        fn set_peers(&self, _peers: Vec<String>) {}
    }

    fn entry_with(cacheable: bool, ttl: Duration, accept_ranges: Option<&str>) -> CacheEntry {
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "10".to_string());
        if let Some(v) = accept_ranges {
            headers.insert("accept-ranges".to_string(), v.to_string());
        }
        CacheEntry {
            content_key: "abc".to_string(),
            headers,
            total_size: 10,
            decision: CacheDecision {
                cacheable,
                expiration: SystemTime::now() + ttl,
                reasons: if cacheable { Vec::new() } else { vec!["no-store".to_string()] },
                warnings: Vec::new(),
            },
        }
    }

    fn orchestrator(outcome: CacheOutcome, passthrough: Vec<String>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(FakeHydrator { outcome }),
            Arc::new(NullMetadataCache),
            Arc::new(NullGroupCache),
            OrchestratorConfig::new(4, passthrough),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn passthrough_short_circuits_before_hydration() {
        let orch = orchestrator(
            CacheOutcome::Cached(entry_with(true, Duration::from_secs(3600), None)),
            vec!["^http://live\\.".to_string()],
        );
        let url = Url::parse("http://live.example/feed").unwrap();
        let outcome = orch.get_metadata(&url).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::NotCacheable));
    }

    #[tokio::test]
    async fn near_expiry_entries_are_rejected() {
        let orch = orchestrator(
            CacheOutcome::Cached(entry_with(true, Duration::from_secs(30), None)),
            Vec::new(),
        );
        let url = Url::parse("http://mirror.example/pkg").unwrap();
        let outcome = orch.get_metadata(&url).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::NotCacheable));
    }

    #[tokio::test]
    async fn accept_ranges_none_is_rejected() {
        let orch = orchestrator(
            CacheOutcome::Cached(entry_with(true, Duration::from_secs(3600), Some("none"))),
            Vec::new(),
        );
        let url = Url::parse("http://mirror.example/pkg").unwrap();
        let outcome = orch.get_metadata(&url).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::NotCacheable));
    }

    #[tokio::test]
    async fn healthy_entry_is_installed_and_returned() {
        let orch = orchestrator(
            CacheOutcome::Cached(entry_with(true, Duration::from_secs(3600), Some("bytes"))),
            Vec::new(),
        );
        let url = Url::parse("http://mirror.example/pkg").unwrap();
        let outcome = orch.get_metadata(&url).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::Cached(_)));
        assert_eq!(orch.metrics().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn get_builds_a_reader_covering_the_whole_object() {
        let orch = orchestrator(CacheOutcome::NotCacheable, Vec::new());
        let url = Url::parse("http://mirror.example/pkg").unwrap();
        let entry = entry_with(true, Duration::from_secs(3600), Some("bytes"));
        let reader = orch.get(&url, &entry);
        assert_eq!(reader.size(), 10);
        let bytes = reader.read_at(0, 10).await.unwrap();
        assert_eq!(bytes.len(), 10);
    }
}
