//! Consistent hash ring for sharding block-cache keys across peers.
//!
//! Each peer is hashed onto `REPLICAS` points on a 32-bit ring; a key's
//! owner is the first peer point at or after the key's own hash, wrapping
//! around to the smallest point if the key hashes past the last one. More
//! replicas smooth the distribution at the cost of a larger ring to search.

use std::collections::BTreeMap;

use crc::{Crc, CRC_32_ISO_HDLC};

const REPLICAS: u32 = 150;
const HASHER: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn hash(data: &str) -> u32 {
    HASHER.checksum(data.as_bytes())
}

#[derive(Default)]
pub struct HashRing {
    ring: BTreeMap<u32, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self { ring: BTreeMap::new() }
    }

    pub fn set_peers(&mut self, peers: &[String]) {
        self.ring.clear();
        for peer in peers {
            for replica in 0..REPLICAS {
                let point = hash(&format!("{peer}#{replica}"));
                self.ring.insert(point, peer.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The peer that owns `key`, or `None` if no peers are registered.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let point = hash(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, peer)| peer.as_str())
    }
}
