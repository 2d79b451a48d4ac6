use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use nostr::{Event, EventId, PublicKey};

use crate::storage::{
    BlockList, FilterStore, MessageStore, RelayRecordStore, RemovalReason, TombstoneStore,
};

/// Ephemeral backend for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryDb {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: HashMap<EventId, Event>,
    marks: HashMap<EventId, RemovalReason>,
    relay_records: BTreeSet<(EventId, String)>,
    filters: HashMap<String, Vec<u8>>,
    blocked: BTreeSet<PublicKey>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl MessageStore for MemoryDb {
    fn filter(&self, predicate: Option<&dyn Fn(&Event) -> bool>) -> anyhow::Result<Vec<Event>> {
        let state = self.state();
        Ok(state
            .messages
            .values()
            .filter(|ev| predicate.map(|p| p(ev)).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn get(&self, id: &EventId) -> anyhow::Result<Option<Event>> {
        Ok(self.state().messages.get(id).cloned())
    }

    fn put(&self, event: &Event) -> anyhow::Result<()> {
        self.state().messages.insert(event.id, event.clone());
        Ok(())
    }
}

impl TombstoneStore for MemoryDb {
    fn get_mark(&self, id: &EventId) -> anyhow::Result<Option<RemovalReason>> {
        Ok(self.state().marks.get(id).cloned())
    }

    fn mark_event(&self, id: &EventId, reason: &RemovalReason) -> anyhow::Result<()> {
        self.state()
            .marks
            .entry(*id)
            .or_insert_with(|| reason.clone());
        Ok(())
    }

    fn get_all_marks(&self) -> anyhow::Result<Vec<(EventId, RemovalReason)>> {
        Ok(self
            .state()
            .marks
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect())
    }
}

impl RelayRecordStore for MemoryDb {
    fn set_relay_record(&self, id: &EventId, url: &str) -> anyhow::Result<()> {
        self.state().relay_records.insert((*id, url.to_string()));
        Ok(())
    }

    fn get_all_relay_records(&self) -> anyhow::Result<Vec<(EventId, String)>> {
        Ok(self.state().relay_records.iter().cloned().collect())
    }
}

impl FilterStore for MemoryDb {
    fn save_filter(&self, url: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.state().filters.insert(url.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_filters(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .state()
            .filters
            .iter()
            .map(|(url, bytes)| (url.clone(), bytes.clone()))
            .collect())
    }
}

impl BlockList for MemoryDb {
    fn is_blocked(&self, pubkey: &PublicKey) -> bool {
        self.state().blocked.contains(pubkey)
    }

    fn block(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.state().blocked.insert(*pubkey);
        Ok(())
    }

    fn unblock(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.state().blocked.remove(pubkey);
        Ok(())
    }

    fn blocked(&self) -> Vec<PublicKey> {
        self.state().blocked.iter().copied().collect()
    }
}
