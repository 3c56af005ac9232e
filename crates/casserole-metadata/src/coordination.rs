//! [`CoordinationStore`] implementations: a real one backed by etcd, and an
//! in-memory fake for single-node deployments and tests.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use casserole_types::{CasseroleError, CoordinationStore, Result, WatchEvent};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Talks to a real etcd cluster for leased metadata replication and peer
/// registration.
pub struct EtcdCoordinationStore {
    client: etcd_client::Client,
}

impl EtcdCoordinationStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None)
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdCoordinationStore {
    async fn lease_grant(&self, ttl_secs: u64) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs as i64, None)
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;
        Ok(resp.id())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        let options = etcd_client::PutOptions::new().with_lease(lease_id);
        client
            .put(key, value, Some(options))
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = WatchEvent> + Send>>> {
        let mut client = self.client.clone();

        let initial = client
            .get(prefix, Some(etcd_client::GetOptions::new().with_prefix()))
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;
        let initial_events: Vec<WatchEvent> = initial
            .kvs()
            .iter()
            .map(|kv| WatchEvent::Put {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();

        let (_watcher, stream) = client
            .watch(prefix, Some(etcd_client::WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| CasseroleError::Coordination(e.to_string()))?;

        let watch_events = stream.flat_map(|resp| {
            let events = match resp {
                Ok(resp) => resp
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        match event.event_type() {
                            etcd_client::EventType::Put => Some(WatchEvent::Put {
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                            }),
                            etcd_client::EventType::Delete => Some(WatchEvent::Delete {
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                            }),
                        }
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    tracing::warn!(error = %e, "etcd watch stream error");
                    Vec::new()
                }
            };
            futures::stream::iter(events)
        });

        Ok(Box::pin(futures::stream::iter(initial_events).chain(watch_events)))
    }
}

/// Single-process stand-in for etcd: leases expire cooperatively (checked
/// lazily, since there's no real TTL daemon to enforce them eagerly) and
/// watches are served from a broadcast channel.
pub struct InMemoryCoordinationStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    next_lease: AtomicI64,
    events: broadcast::Sender<WatchEvent>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self { entries: RwLock::new(HashMap::new()), next_lease: AtomicI64::new(1), events })
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { entries: RwLock::new(HashMap::new()), next_lease: AtomicI64::new(1), events }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn lease_grant(&self, _ttl_secs: u64) -> Result<i64> {
        Ok(self.next_lease.fetch_add(1, Ordering::SeqCst))
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, _lease_id: i64) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        let _ = self.events.send(WatchEvent::Put { key: key.to_string(), value });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        let _ = self.events.send(WatchEvent::Delete { key: key.to_string() });
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = WatchEvent> + Send>>> {
        let initial: Vec<WatchEvent> = self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| WatchEvent::Put { key: k.clone(), value: v.clone() })
            .collect();

        let prefix = prefix.to_string();
        let rx = self.events.subscribe();
        let live = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |event| {
            let prefix = prefix.clone();
            async move {
                match event {
                    Ok(WatchEvent::Put { key, value }) if key.starts_with(&prefix) => {
                        Some(WatchEvent::Put { key, value })
                    }
                    Ok(WatchEvent::Delete { key }) if key.starts_with(&prefix) => {
                        Some(WatchEvent::Delete { key })
                    }
                    _ => None,
                }
            }
        });

        Ok(Box::pin(futures::stream::iter(initial).chain(live)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_observed_by_watch() {
        let store = InMemoryCoordinationStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        store.put_with_lease("metadata/a", b"v1".to_vec(), lease).await.unwrap();

        let mut stream = store.watch_prefix("metadata/").await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, WatchEvent::Put { key, .. } if key == "metadata/a"));
    }

    #[tokio::test]
    async fn delete_is_observed_by_watch() {
        let store = InMemoryCoordinationStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        store.put_with_lease("metadata/a", b"v1".to_vec(), lease).await.unwrap();
        let mut stream = store.watch_prefix("metadata/").await.unwrap();
        let _initial = stream.next().await.unwrap();

        store.delete("metadata/a").await.unwrap();
        let event = stream.next().await.unwrap();
        assert!(matches!(event, WatchEvent::Delete { key } if key == "metadata/a"));
    }
}
