use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::feed::DEFAULT_FEED_CAPACITY;

pub const CONFIG_FILE_NAME: &str = "pika_store_config.json";

/// Default for [`StoreConfig::max_pending_deletions_per_author`].
pub const DEFAULT_MAX_PENDING_DELETIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceMode {
    Exact,
    Bloom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub feed_capacity: usize,
    pub provenance: ProvenanceMode,
    pub bloom_bits: u64,
    pub bloom_hashes: u32,
    pub verify_signatures: bool,
    /// Deletions naming messages not seen yet are remembered per author up to
    /// this many targets; past it the oldest target is forgotten and that
    /// message is admitted normally if it ever arrives.
    pub max_pending_deletions_per_author: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            feed_capacity: DEFAULT_FEED_CAPACITY,
            provenance: ProvenanceMode::Bloom,
            bloom_bits: 1 << 20,
            bloom_hashes: 7,
            verify_signatures: true,
            max_pending_deletions_per_author: DEFAULT_MAX_PENDING_DELETIONS,
        }
    }
}

/// Read `<data_dir>/pika_store_config.json`. Never fails: a missing file means
/// defaults, an unreadable one means defaults plus a warning.
pub fn load_config(data_dir: &Path) -> StoreConfig {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let raw = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreConfig::default(),
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "failed to read store config; using defaults");
            return StoreConfig::default();
        }
    };
    match serde_json::from_str::<StoreConfig>(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "invalid store config; using defaults");
            StoreConfig::default()
        }
    }
}
