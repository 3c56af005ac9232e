mod error;
mod key;

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use url::Url;

pub use error::{CasseroleError, Result};
pub use key::generate_content_key;

/// Default block size used to carve an object into independently cacheable
/// chunks: 2 MiB, matching the original deployment's tuning.
pub const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Number of blocks needed to cover `total_size` bytes at `block_size`.
///
/// Uses ceiling division (`(S + B - 1) / B`). The historical formula added
/// one unconditionally (`S/B + 1`), which allocates a trailing empty block
/// whenever `total_size` is an exact multiple of `block_size`; callers that
/// relied on that extra block do not exist, so this crate always uses the
/// corrected formula.
pub fn block_count(total_size: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    (total_size + block_size - 1) / block_size
}

/// The byte range `[start, end)` covered by block `index` of an object of
/// `total_size` bytes, clamped so the final block isn't overrun.
pub fn block_range(index: u64, total_size: u64, block_size: u64) -> (u64, u64) {
    let start = index * block_size;
    let end = (start + block_size).min(total_size);
    (start, end)
}

/// A `Box<dyn Stream>` of body chunks, the common currency for origin
/// responses that are read once and forwarded rather than buffered.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// Caching verdict for an object, derived from the origin's response headers.
///
/// `reasons` records why the decision came out the way it did (useful for
/// diagnostics and for the `Warning` headers the client surface attaches);
/// `warnings` carries RFC 7234-style warn-text that should be forwarded to
/// the client as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDecision {
    pub cacheable: bool,
    pub expiration: SystemTime,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl CacheDecision {
    pub fn uncacheable(reason: impl Into<String>) -> Self {
        Self {
            cacheable: false,
            expiration: SystemTime::UNIX_EPOCH,
            reasons: vec![reason.into()],
            warnings: Vec::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expiration
    }
}

/// Cached metadata for one object: its identity headers plus the decision
/// that was made when those headers were last fetched from the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_key: String,
    pub headers: HashMap<String, String>,
    pub total_size: u64,
    pub decision: CacheDecision,
}

/// Outcome of a metadata lookup: either a usable entry, or one of the two
/// reasons an object can never be served from the block cache.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Cached(CacheEntry),
    /// Policy forbids caching (private, no-store, a configured passthrough
    /// pattern, or a validator that is about to expire).
    NotCacheable,
    /// Origin used chunked transfer encoding with no `Content-Length`, so
    /// the object can't be carved into blocks.
    Chunked,
}

/// Identifies a metadata lookup: the object's URL plus its content key once
/// known (the key is `None` until the first successful hydration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub url: Url,
}

/// Identifies a single block fetch: which object, which block index, and
/// enough sizing information to compute the block's byte range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub url: Url,
    pub content_key: String,
    pub block: u64,
    pub total_size: u64,
    pub block_size: u64,
}

impl DataRequest {
    pub fn range(&self) -> (u64, u64) {
        block_range(self.block, self.total_size, self.block_size)
    }

    /// The key under which this block is stored in the distributed cache.
    ///
    /// Encodes the full request as JSON rather than just `content_key` and
    /// `block` so a cache miss on another peer can be serviced without a
    /// side channel back to the requester: everything the getter needs
    /// (`total_size`, `block_size`) travels with the key itself, the same
    /// trick the original implementation used by marshaling its whole
    /// request struct as the distributed cache key.
    pub fn cache_key(&self) -> String {
        format!("data/{}", serde_json::to_string(self).unwrap_or_default())
    }

    /// Recovers a request from a key produced by [`Self::cache_key`].
    pub fn from_cache_key(key: &str) -> Option<Self> {
        let payload = key.strip_prefix("data/")?;
        serde_json::from_str(payload).ok()
    }

    /// Short, stable key used by the disk store, distinct from
    /// [`Self::cache_key`] which is verbose JSON meant for the distributed
    /// cache's routing, not for naming files on disk. Matches the on-disk
    /// layout in spec.md §3/§6 exactly: `"{content-key}-{blockIndex}"`.
    pub fn disk_key(&self) -> String {
        format!("{}-{}", self.content_key, self.block)
    }
}

impl MetadataRequest {
    /// The key under which this object's metadata is stored in the
    /// distributed cache, disambiguated by the `metadata/` prefix.
    pub fn cache_key(&self) -> String {
        format!("metadata/{}", self.url)
    }

    /// Recovers a request from a key produced by [`Self::cache_key`].
    pub fn from_cache_key(key: &str) -> Option<Self> {
        let payload = key.strip_prefix("metadata/")?;
        Url::parse(payload).ok().map(|url| Self { url })
    }
}

/// A full response read from the origin outside the normal block-hydration
/// path: used for passthrough (uncacheable) requests and HEAD-equivalent
/// metadata probes.
pub struct OriginResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Speaks to the upstream origin: probes identity/cacheability, fetches a
/// single block by byte range, or streams a full uncacheable response.
#[async_trait::async_trait]
pub trait Hydrator: Send + Sync {
    /// Issues a conditional probe (HEAD, or a minimal ranged GET against
    /// origins that reject HEAD) and turns the response headers into a
    /// caching decision plus the object's identity metadata.
    async fn get_metadata(&self, url: &Url) -> Result<CacheOutcome>;

    /// Fetches the bytes for `[start, end)` of `url` from the origin.
    async fn get(&self, url: &Url, start: u64, end: u64) -> Result<Bytes>;

    /// Streams the full response body verbatim, bypassing the block cache.
    /// Used when `get_metadata` returned `NotCacheable` or `Chunked`.
    async fn force_get(&self, url: &Url) -> Result<OriginResponse>;
}

/// Persists blocks to local disk under a size cap, evicting the
/// least-recently-hit block first.
#[async_trait::async_trait]
pub trait DiskStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    /// Reads `[offset, offset+length)` of `key`'s stored bytes, touching its
    /// last-hit timestamp the same as [`Self::get`]. The default
    /// implementation is a correct but non-zero-copy fallback (a full
    /// [`Self::get`] sliced in memory); [`crate`]'s real store overrides this
    /// with an actual seek-and-read so large blocks don't need to be fully
    /// buffered for a small sub-range.
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Bytes>> {
        Ok(self.get(key).await?.map(|data| {
            let start = offset.min(data.len() as u64) as usize;
            let end = (offset + length).min(data.len() as u64) as usize;
            data.slice(start..end)
        }))
    }
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    /// Records a cache hit against `key`'s eviction timestamp without
    /// reading its data back.
    async fn hit(&self, key: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// Current on-disk footprint in bytes, for metrics and tests.
    fn total_size(&self) -> u64;

    /// Raw filesystem path of an already-stored block, for callers that want
    /// a zero-copy path (e.g. `sendfile`-backed response bodies) instead of
    /// going through [`Self::get`]. `None` for stores with no backing file
    /// (in-memory fakes, the disabled-disk-cache stand-in) or when `key`
    /// isn't stored.
    fn file_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Graceful-shutdown hook. A no-op by default: the size counter this
    /// store maintains is an in-process cache of what's on disk, not a
    /// durable record, so there's nothing to flush on the way out. Any
    /// drift between this process's last-known size and the next process's
    /// startup reality is corrected by the startup reconciliation pass, not
    /// by anything `shutdown` could do here.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory record of known-good metadata, replicated across peers via a
/// [`CoordinationStore`].
#[async_trait::async_trait]
pub trait MetadataCache: Send + Sync {
    async fn get(&self, url: &Url) -> Option<CacheEntry>;
    async fn add(&self, url: &Url, entry: CacheEntry, ttl_secs: u64) -> Result<()>;
    async fn remove(&self, url: &Url) -> Result<()>;
}

/// The distributed, peer-sharded block cache: every key belongs to exactly
/// one peer (chosen by consistent hashing), and `get` transparently forwards
/// to that peer when it isn't the local node.
#[async_trait::async_trait]
pub trait GroupCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes>;
    /// Replaces the set of known peers (addresses usable as HTTP base URLs).
    fn set_peers(&self, peers: Vec<String>);
}

/// A change observed on a watched coordination-store prefix.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Abstracts the distributed coordination KV (etcd in production, an
/// in-memory fake in tests) used for leased metadata replication and peer
/// registration.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grants a lease valid for `ttl_secs` and returns its id.
    async fn lease_grant(&self, ttl_secs: u64) -> Result<i64>;
    async fn put_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: i64,
    ) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Streams put/delete events for every key under `prefix`, starting
    /// with the prefix's current contents as synthetic `Put` events.
    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = WatchEvent> + Send>>>;
}

/// Bundles the two collaborators a distributed-cache getter needs to fill a
/// miss: local disk storage and the means to hydrate from origin.
#[derive(Clone)]
pub struct CacheContext {
    pub disk: Arc<dyn DiskStore>,
    pub hydrator: Arc<dyn Hydrator>,
}
