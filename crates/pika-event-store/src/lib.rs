//! Client-side event store and conversation engine for Nostr direct messaging.
//!
//! Signed messages arrive redundantly and out of order from many relays.
//! [`EventStore`] admits each one once, remembers which relays vouched for it
//! and republishes an ordered change feed. [`ChatCore`] consumes that feed to
//! keep decrypted conversations and per-counterparty summaries current.

pub mod client;
pub mod config;
pub mod conversation;
pub mod dm;
pub mod error;
pub mod feed;
pub mod lamport;
pub mod logging;
pub mod memory_db;
pub mod message;
pub mod profile;
pub mod provenance;
pub mod rich_text;
pub mod sqlite_db;
pub mod storage;
pub mod store;
pub mod verify;

pub use client::{ChatCore, Delivery, IngestStats};
pub use config::{load_config, ProvenanceMode, StoreConfig};
pub use conversation::{BatchOutcome, Classification, ConversationIndex, ConversationSummary};
pub use dm::{
    build_direct_message, display_order, resolve_counterparty, sort_for_display, ChatContent,
    ChatMessage, Decryptor, DmPipeline, Nip04Decryptor,
};
pub use error::Error;
pub use feed::{Feed, Tap, DEFAULT_FEED_CAPACITY};
pub use lamport::LamportClock;
pub use memory_db::MemoryDb;
pub use message::{Incoming, MessageKind, ParsedMessage, TagIndex};
pub use profile::Profile;
pub use provenance::{BloomFilter, BloomProvenance, ExactProvenance, RelayProvenance};
pub use rich_text::{RichText, Token};
pub use sqlite_db::SqliteDb;
pub use storage::{
    BlockList, FilterStore, MessageStore, RelayRecordStore, RemovalReason, TombstoneStore,
};
pub use store::{Admitted, EventStore, StoreEvent, StoreParts};
pub use verify::{SchnorrVerifier, TrustAll, Verifier};
