//! Binary entrypoint: parses configuration, wires the hydrator, disk store,
//! coordination store, metadata cache, and distributed block cache into one
//! [`Orchestrator`], and runs the client-facing and inter-peer listeners.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use casserole_core::{Orchestrator, OrchestratorConfig};
use casserole_disk::{DiskStoreConfig, SledDiskStore};
use casserole_groupcache::{transport, DistributedBlockCache, GroupCacheConfig};
use casserole_hydrator::{HydratorConfig, ReqwestHydrator};
use casserole_metadata::{
    coordination::{EtcdCoordinationStore, InMemoryCoordinationStore},
    SyncedMetadataCache,
};
use casserole_server::{build_router, config::Cli, config::Settings, handler::AppState, peer_tracker};
use casserole_types::{CacheContext, CoordinationStore, DiskStore, DEFAULT_BLOCK_SIZE};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let settings = Settings::load(Cli::parse()).context("loading configuration")?;

    let hydrator = Arc::new(
        ReqwestHydrator::new(HydratorConfig::new(settings.mirror_url.clone()))
            .context("building origin hydrator")?,
    );

    let disk: Arc<dyn DiskStore> = if settings.disk_cache_enabled {
        let max_size = settings.max_disk_usage_bytes().context("parsing max-disk-usage")?;
        let cleaned_size =
            settings.cleaned_disk_usage_bytes().context("parsing cleaned-disk-usage")?;
        Arc::new(
            SledDiskStore::open(DiskStoreConfig::new(
                settings.disk_cache_dir.clone(),
                max_size,
                cleaned_size,
            ))
            .await
            .context("opening disk cache")?,
        )
    } else {
        Arc::new(NullDiskStore)
    };

    let coordination: Arc<dyn CoordinationStore> = if settings.etcd.is_empty() {
        tracing::info!("no etcd endpoints configured, running single-node with an in-process coordination store");
        InMemoryCoordinationStore::new()
    } else {
        // The original waits briefly for etcd to accept connections before
        // registering this node, so a cluster coming up together doesn't
        // race its own peers into the registry. A fixed startup delay
        // mirrors that without needing a readiness probe against etcd.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        Arc::new(
            EtcdCoordinationStore::connect(&settings.etcd)
                .await
                .context("connecting to etcd")?,
        )
    };

    let metadata = Arc::new(SyncedMetadataCache::new(coordination.clone()));

    let max_memory = settings.max_memory_usage_bytes().context("parsing max-memory-usage")?;
    let block_capacity = (max_memory / DEFAULT_BLOCK_SIZE).max(1);
    let group = DistributedBlockCache::new(
        settings.peering_address.clone(),
        CacheContext { disk, hydrator: hydrator.clone() },
        GroupCacheConfig { main_capacity: block_capacity, hot_capacity: block_capacity },
    );

    let orchestrator = Orchestrator::new(
        hydrator,
        metadata,
        group.clone(),
        OrchestratorConfig::new(DEFAULT_BLOCK_SIZE, settings.passthrough.clone()),
    )
    .context("building orchestrator")?;

    peer_tracker::spawn(coordination, settings.peering_address.clone(), group.clone());

    let peering_listener = peering_bind_address(&settings.peering_address)?;
    let internal_listener = tokio::net::TcpListener::bind(&peering_listener)
        .await
        .with_context(|| format!("binding inter-peer listener on {peering_listener}"))?;
    let internal_router = transport::router(group);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(internal_listener, internal_router).await {
            tracing::error!(error = %e, "inter-peer listener exited");
        }
    });

    let state = Arc::new(AppState {
        orchestrator,
        mirror_url: settings.mirror_url.clone(),
        block_size: DEFAULT_BLOCK_SIZE,
    });
    let router = build_router(state);

    let client_listener = tokio::net::TcpListener::bind(&settings.address)
        .await
        .with_context(|| format!("binding client listener on {}", settings.address))?;
    tracing::info!(address = %settings.address, "casserole listening");
    axum::serve(client_listener, router).await.context("client listener exited")?;

    Ok(())
}

/// Strips the scheme from a configured peer URL to get a bindable
/// `host:port`, the same transformation `peer_tracker::peer_id` applies for
/// registry keys.
fn peering_bind_address(peering_address: &str) -> Result<String> {
    let stripped =
        peering_address.trim_start_matches("https://").trim_start_matches("http://");
    if stripped.is_empty() {
        return Err(anyhow!("empty peering-address"));
    }
    Ok(stripped.to_string())
}

/// Used when disk caching is disabled: every block is served from the
/// in-memory tiers and the origin only, with nothing persisted.
struct NullDiskStore;

#[async_trait::async_trait]
impl DiskStore for NullDiskStore {
    async fn get(&self, _key: &str) -> casserole_types::Result<Option<bytes::Bytes>> {
        Ok(None)
    }
    async fn put(&self, _key: &str, _data: bytes::Bytes) -> casserole_types::Result<()> {
        Ok(())
    }
    async fn hit(&self, _key: &str) -> casserole_types::Result<()> {
        Ok(())
    }
    async fn remove(&self, _key: &str) -> casserole_types::Result<()> {
        Ok(())
    }
    fn total_size(&self) -> u64 {
        0
    }
}
