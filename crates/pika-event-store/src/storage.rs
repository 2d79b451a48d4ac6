//! Persistence collaborators consumed by the store.
//!
//! The in-memory maps in [`crate::store::EventStore`] are the source of truth for
//! a session; these traits only make that state survive a restart. Failures are
//! reported as `anyhow` errors and logged by the caller.

use nostr::{Event, EventId, PublicKey};
use serde::{Deserialize, Serialize};

/// Why an id was tombstoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RemovalReason {
    UserRemoved,
    /// Removed by a deletion message from the same author.
    Deleted {
        by: String,
    },
    Other {
        reason: String,
    },
}

impl RemovalReason {
    pub fn deleted_by(deletion: EventId) -> Self {
        RemovalReason::Deleted {
            by: deletion.to_hex(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"user_removed\"}".to_string())
    }

    /// Unknown or corrupt reasons still count as removals.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_else(|_| RemovalReason::Other {
            reason: json.to_string(),
        })
    }
}

pub trait MessageStore: Send + Sync {
    /// All stored messages, optionally narrowed by `predicate`.
    fn filter(&self, predicate: Option<&dyn Fn(&Event) -> bool>) -> anyhow::Result<Vec<Event>>;
    fn get(&self, id: &EventId) -> anyhow::Result<Option<Event>>;
    fn put(&self, event: &Event) -> anyhow::Result<()>;
}

pub trait TombstoneStore: Send + Sync {
    fn get_mark(&self, id: &EventId) -> anyhow::Result<Option<RemovalReason>>;
    fn mark_event(&self, id: &EventId, reason: &RemovalReason) -> anyhow::Result<()>;
    fn get_all_marks(&self) -> anyhow::Result<Vec<(EventId, RemovalReason)>>;
}

/// Exact provenance records: one row per (message, relay) pair.
pub trait RelayRecordStore: Send + Sync {
    fn set_relay_record(&self, id: &EventId, url: &str) -> anyhow::Result<()>;
    fn get_all_relay_records(&self) -> anyhow::Result<Vec<(EventId, String)>>;
}

/// Serialized Bloom filters, one per relay url.
pub trait FilterStore: Send + Sync {
    fn save_filter(&self, url: &str, bytes: &[u8]) -> anyhow::Result<()>;
    fn load_filters(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

/// Local, per-device list of blocked counterparties.
pub trait BlockList: Send + Sync {
    fn is_blocked(&self, pubkey: &PublicKey) -> bool;
    fn block(&self, pubkey: &PublicKey) -> anyhow::Result<()>;
    fn unblock(&self, pubkey: &PublicKey) -> anyhow::Result<()>;
    fn blocked(&self) -> Vec<PublicKey>;
}
