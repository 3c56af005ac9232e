//! Local metadata cache kept consistent across peers by replaying
//! put/delete events from a [`CoordinationStore`] watch.

pub mod coordination;

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use casserole_types::{CacheEntry, CoordinationStore, MetadataCache, Result, WatchEvent};
use futures::StreamExt;
use parking_lot::RwLock;
use url::Url;

fn cache_key(url: &Url) -> String {
    url.to_string()
}

/// [`MetadataCache`] backed by an in-process map, replicated to peers via
/// `coordination`. Every write goes out as a leased put so an object's
/// metadata disappears from every peer the moment its cache decision
/// expires, without an explicit cascade delete.
///
/// Coordination-store keys are the bare request URL with no prefix, per
/// spec.md §3/§6 ("Metadata at top-level keys = request URL (no prefix)") —
/// distinct from the `metadata/`/`data/`-prefixed key space
/// `casserole-groupcache` uses for its own, unrelated distributed cache.
/// Watching the whole coordination keyspace (an empty prefix) also surfaces
/// the peer registry's own puts/deletes under `casserole/peers/`; those fail
/// to deserialize as a `CacheEntry` and are logged and dropped, matching
/// spec.md §7's "the metadata syncer logs and continues on decode failures".
pub struct SyncedMetadataCache {
    local: Arc<RwLock<HashMap<String, CacheEntry>>>,
    coordination: Arc<dyn CoordinationStore>,
}

impl SyncedMetadataCache {
    /// Builds the cache and spawns the background task that keeps `local`
    /// in sync with every peer's writes. The returned cache is immediately
    /// usable; the initial snapshot populates asynchronously as the watch
    /// stream's synthetic `Put` events for existing keys arrive.
    pub fn new(coordination: Arc<dyn CoordinationStore>) -> Self {
        let cache = Self { local: Arc::new(RwLock::new(HashMap::new())), coordination };
        cache.spawn_sync_task();
        cache
    }

    fn spawn_sync_task(&self) {
        let local = self.local.clone();
        let coordination = self.coordination.clone();
        tokio::spawn(async move {
            let mut stream = match coordination.watch_prefix("").await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start metadata watch");
                    return;
                }
            };
            while let Some(event) = stream.next().await {
                match event {
                    WatchEvent::Put { key, value } => match serde_json::from_slice::<CacheEntry>(&value)
                    {
                        Ok(entry) => {
                            local.write().insert(key, entry);
                        }
                        Err(e) => tracing::warn!(error = %e, key = %key, "dropping malformed metadata event"),
                    },
                    WatchEvent::Delete { key } => {
                        local.write().remove(&key);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl MetadataCache for SyncedMetadataCache {
    async fn get(&self, url: &Url) -> Option<CacheEntry> {
        let entry = self.local.read().get(&cache_key(url)).cloned()?;
        // The watch loop only removes an entry once its delete event
        // arrives; between the coordination store's lease expiring and
        // that event propagating, a local read could still see a
        // technically-expired entry. Filter it out here rather than hand
        // a stale entry to a caller that would treat it as fresh.
        is_usable(&entry).then_some(entry)
    }

    async fn add(&self, url: &Url, entry: CacheEntry, ttl_secs: u64) -> Result<()> {
        let key = cache_key(url);
        let value = serde_json::to_vec(&entry)?;
        let lease = self.coordination.lease_grant(ttl_secs).await?;
        self.coordination.put_with_lease(&key, value, lease).await?;
        // The watch loop will also apply this put once it round-trips
        // through the coordination store; inserting here means readers on
        // this node see it immediately rather than waiting on that hop.
        self.local.write().insert(key, entry);
        Ok(())
    }

    async fn remove(&self, url: &Url) -> Result<()> {
        let key = cache_key(url);
        self.coordination.delete(&key).await?;
        self.local.write().remove(&key);
        Ok(())
    }
}

/// Returns whether an entry should be treated as cacheable, considering
/// both its own decision and (per the no-cascade-delete design) accepting
/// that a peer may observe an entry slightly past expiration between the
/// lease's server-side TTL firing and the delete watch event arriving.
pub fn is_usable(entry: &CacheEntry) -> bool {
    entry.decision.cacheable && SystemTime::now() < entry.decision.expiration
}
