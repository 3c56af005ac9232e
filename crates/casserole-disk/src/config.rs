use std::path::PathBuf;

/// Sizing for a [`crate::SledDiskStore`].
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// Directory blocks and the timestamp table are stored under.
    pub root: PathBuf,
    /// Eviction triggers once the store's on-disk footprint exceeds this.
    pub max_size: u64,
    /// Eviction runs until the footprint is back at or below this. Kept
    /// below `max_size` so a single eviction pass doesn't immediately
    /// re-trigger on the next put.
    pub cleaned_size: u64,
}

impl DiskStoreConfig {
    pub fn new(root: impl Into<PathBuf>, max_size: u64, cleaned_size: u64) -> Self {
        Self { root: root.into(), max_size, cleaned_size }
    }
}
