//! Keeps the distributed block cache's peer set current.
//!
//! A direct Rust realization of `peertracker.NewPeerTracker`: this node
//! registers its own address under `{base_path}/{peer_id}` with a lease
//! refreshed at half its TTL, and a prefix watch over `base_path` maintains
//! the full live peer list, calling `GroupCache::set_peers` on every change.
//! Unlike the CLI/config bootstrap, peer discovery is named in spec.md §1
//! as an external collaborator the core only consumes through `set_peers`;
//! this module is the concrete stand-in casserole-server supplies so the
//! binary is runnable without a separate peer-tracker process.

use std::{collections::HashMap, sync::Arc, time::Duration};

use casserole_types::{CoordinationStore, GroupCache, WatchEvent};
use futures::StreamExt;

const PEER_BASE_PATH: &str = "casserole/peers/";
/// Matches the original tracker's literal `60 * time.Second` registration TTL.
const REGISTRATION_TTL: Duration = Duration::from_secs(60);

fn peer_id(address: &str) -> String {
    address.trim_start_matches("https://").trim_start_matches("http://").to_string()
}

/// Spawns the registration-refresh loop and the peer-watch loop. Both run
/// for the lifetime of the process; there's no handle to stop them because
/// the server never tears down its own peer membership except by exiting.
pub fn spawn(
    coordination: Arc<dyn CoordinationStore>,
    self_address: String,
    group: Arc<dyn GroupCache>,
) {
    spawn_registration(coordination.clone(), self_address);
    spawn_watch(coordination, group);
}

fn spawn_registration(coordination: Arc<dyn CoordinationStore>, self_address: String) {
    let key = format!("{PEER_BASE_PATH}{}", peer_id(&self_address));
    tokio::spawn(async move {
        loop {
            match coordination.lease_grant(REGISTRATION_TTL.as_secs()).await {
                Ok(lease) => {
                    if let Err(e) = coordination
                        .put_with_lease(&key, self_address.clone().into_bytes(), lease)
                        .await
                    {
                        tracing::error!(error = %e, "failed to refresh peer registration");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to acquire peer registration lease"),
            }
            tokio::time::sleep(REGISTRATION_TTL / 2).await;
        }
    });
}

fn spawn_watch(coordination: Arc<dyn CoordinationStore>, group: Arc<dyn GroupCache>) {
    tokio::spawn(async move {
        let mut stream = match coordination.watch_prefix(PEER_BASE_PATH).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to start peer watch");
                return;
            }
        };

        let mut peers: HashMap<String, String> = HashMap::new();
        while let Some(event) = stream.next().await {
            match event {
                WatchEvent::Put { key, value } => {
                    let address = String::from_utf8_lossy(&value).into_owned();
                    peers.insert(key, address);
                }
                WatchEvent::Delete { key } => {
                    peers.remove(&key);
                }
            }
            let mut addresses: Vec<String> = peers.values().cloned().collect();
            addresses.sort();
            tracing::info!(peers = ?addresses, "peer set updated");
            group.set_peers(addresses);
        }
    });
}
