//! The authoritative in-memory index of admitted messages.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nostr::{EventId, PublicKey};

use crate::config::{ProvenanceMode, StoreConfig, DEFAULT_MAX_PENDING_DELETIONS};
use crate::error::Error;
use crate::feed::{Feed, Tap, DEFAULT_FEED_CAPACITY};
use crate::lamport::LamportClock;
use crate::memory_db::MemoryDb;
use crate::message::{Incoming, MessageKind, ParsedMessage};
use crate::profile::Profile;
use crate::provenance::{BloomProvenance, ExactProvenance, RelayProvenance};
use crate::storage::{FilterStore, MessageStore, RelayRecordStore, RemovalReason, TombstoneStore};
use crate::verify::{SchnorrVerifier, TrustAll, Verifier};

/// Change notification published on the store feed.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A message was stored for the first time.
    Added {
        message: Arc<ParsedMessage>,
        relay: Option<String>,
    },
    /// An already stored message was delivered by a relay not seen for it before.
    RelayConfirmed {
        message: Arc<ParsedMessage>,
        relay: String,
    },
}

impl StoreEvent {
    pub fn message(&self) -> &Arc<ParsedMessage> {
        match self {
            StoreEvent::Added { message, .. } | StoreEvent::RelayConfirmed { message, .. } => {
                message
            }
        }
    }

    pub fn relay(&self) -> Option<&str> {
        match self {
            StoreEvent::Added { relay, .. } => relay.as_deref(),
            StoreEvent::RelayConfirmed { relay, .. } => Some(relay),
        }
    }
}

/// Successful outcome of [`EventStore::admit`].
#[derive(Debug, Clone)]
pub enum Admitted {
    New(Arc<ParsedMessage>),
    /// Already stored. `relay_recorded` is true when this delivery added provenance.
    Duplicate { relay_recorded: bool },
}

/// Collaborators an [`EventStore`] is assembled from.
pub struct StoreParts {
    pub messages: Arc<dyn MessageStore>,
    pub tombstones: Arc<dyn TombstoneStore>,
    pub provenance: Box<dyn RelayProvenance>,
    pub verifier: Arc<dyn Verifier>,
    pub lamport: Arc<LamportClock>,
    pub feed_capacity: usize,
    pub max_pending_deletions_per_author: usize,
}

struct StoreState {
    messages: HashMap<EventId, Arc<ParsedMessage>>,
    tombstones: HashMap<EventId, RemovalReason>,
    profiles: HashMap<PublicKey, Profile>,
    // target id -> (deletion author, deletion id) seen before the target arrived
    pending_deletions: HashMap<EventId, Vec<(PublicKey, EventId)>>,
    // author -> pending targets, oldest first
    pending_by_author: HashMap<PublicKey, VecDeque<EventId>>,
    max_pending_per_author: usize,
    provenance: Box<dyn RelayProvenance>,
}

enum Indexed {
    Stored { removed: Vec<(EventId, RemovalReason)> },
    Suppressed(RemovalReason),
}

enum Step {
    New(Arc<ParsedMessage>, Vec<(EventId, RemovalReason)>),
    Relay(Arc<ParsedMessage>, String),
    Duplicate,
    Suppressed(RemovalReason),
}

pub struct EventStore {
    state: RwLock<StoreState>,
    messages: Arc<dyn MessageStore>,
    tombstones: Arc<dyn TombstoneStore>,
    verifier: Arc<dyn Verifier>,
    lamport: Arc<LamportClock>,
    feed: Feed<StoreEvent>,
}

impl EventStore {
    /// Build a store and re-index whatever the backing stores already hold.
    /// Loading emits no change notifications.
    pub fn open(parts: StoreParts) -> Self {
        let mut state = StoreState {
            messages: HashMap::new(),
            tombstones: HashMap::new(),
            profiles: HashMap::new(),
            pending_deletions: HashMap::new(),
            pending_by_author: HashMap::new(),
            max_pending_per_author: parts.max_pending_deletions_per_author,
            provenance: parts.provenance,
        };

        match parts.tombstones.get_all_marks() {
            Ok(marks) => state.tombstones.extend(marks),
            Err(e) => tracing::warn!(%e, "failed to load tombstones"),
        }

        let stored = parts.messages.filter(None).unwrap_or_else(|e| {
            tracing::warn!(%e, "failed to load stored messages");
            vec![]
        });
        let mut late_marks = Vec::new();
        for event in stored {
            if state.tombstones.contains_key(&event.id) {
                continue;
            }
            let message = Arc::new(ParsedMessage::new(event));
            if let Some(l) = message.lamport() {
                parts.lamport.set(l);
            }
            match index_new(&mut state, message.clone()) {
                Indexed::Stored { removed } => late_marks.extend(removed),
                Indexed::Suppressed(reason) => late_marks.push((message.id(), reason)),
            }
        }
        for (id, reason) in &late_marks {
            if let Err(e) = parts.tombstones.mark_event(id, reason) {
                tracing::warn!(%e, %id, "failed to persist tombstone");
            }
        }

        tracing::info!(
            messages = state.messages.len(),
            tombstones = state.tombstones.len(),
            profiles = state.profiles.len(),
            "event store loaded"
        );

        Self {
            state: RwLock::new(state),
            messages: parts.messages,
            tombstones: parts.tombstones,
            verifier: parts.verifier,
            lamport: parts.lamport,
            feed: Feed::new("store", parts.feed_capacity),
        }
    }

    /// Assemble a store over one backend that implements every persistence role.
    pub fn with_backend<B>(backend: Arc<B>, config: &StoreConfig) -> Self
    where
        B: MessageStore + TombstoneStore + RelayRecordStore + FilterStore + 'static,
    {
        let provenance: Box<dyn RelayProvenance> = match config.provenance {
            ProvenanceMode::Exact => Box::new(ExactProvenance::load(backend.clone())),
            ProvenanceMode::Bloom => Box::new(BloomProvenance::load(
                backend.clone(),
                config.bloom_bits,
                config.bloom_hashes,
            )),
        };
        let verifier: Arc<dyn Verifier> = if config.verify_signatures {
            Arc::new(SchnorrVerifier)
        } else {
            Arc::new(TrustAll)
        };
        Self::open(StoreParts {
            messages: backend.clone(),
            tombstones: backend,
            provenance,
            verifier,
            lamport: Arc::new(LamportClock::new()),
            feed_capacity: config.feed_capacity,
            max_pending_deletions_per_author: config.max_pending_deletions_per_author,
        })
    }

    /// In-memory store with exact provenance and full signature checks.
    pub fn in_memory() -> Self {
        let db = Arc::new(MemoryDb::new());
        Self::open(StoreParts {
            messages: db.clone(),
            tombstones: db.clone(),
            provenance: Box::new(ExactProvenance::load(db)),
            verifier: Arc::new(SchnorrVerifier),
            lamport: Arc::new(LamportClock::new()),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            max_pending_deletions_per_author: DEFAULT_MAX_PENDING_DELETIONS,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        match self.state.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        match self.state.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Admit a message delivered by `relay` (or produced locally when `None`).
    ///
    /// Order: verify, tombstone check, provenance, index, persist, publish. A
    /// known message never gets stored twice; it only produces a
    /// [`StoreEvent::RelayConfirmed`] when the relay is new for it.
    pub async fn admit(
        &self,
        incoming: impl Into<Incoming>,
        relay: Option<&str>,
    ) -> Result<Admitted, Error> {
        let event = Into::<Incoming>::into(incoming).into_event()?;
        let id = event.id;

        if !self.verifier.verify(&event).await {
            tracing::warn!(%id, relay = ?relay, "rejecting message with invalid signature");
            return Err(Error::VerificationFailed(id));
        }

        let step = {
            let mut state = self.write();
            if state.tombstones.contains_key(&id) {
                tracing::debug!(%id, "ignoring removed message");
                return Err(Error::AlreadyRemoved(id));
            }
            let relay_is_new = match relay {
                Some(url) => state.provenance.record(&id, url),
                None => false,
            };
            match state.messages.get(&id).cloned() {
                Some(existing) => match relay {
                    Some(url) if relay_is_new => Step::Relay(existing, url.to_string()),
                    _ => Step::Duplicate,
                },
                None => {
                    let message = Arc::new(ParsedMessage::new(event));
                    match index_new(&mut state, message.clone()) {
                        Indexed::Stored { removed } => Step::New(message, removed),
                        Indexed::Suppressed(reason) => Step::Suppressed(reason),
                    }
                }
            }
        };

        match step {
            Step::Duplicate => Ok(Admitted::Duplicate {
                relay_recorded: false,
            }),
            Step::Relay(message, url) => {
                tracing::debug!(%id, relay = %url, "new relay for known message");
                self.feed
                    .publish(StoreEvent::RelayConfirmed {
                        message,
                        relay: url,
                    })
                    .await;
                Ok(Admitted::Duplicate {
                    relay_recorded: true,
                })
            }
            Step::Suppressed(reason) => {
                tracing::debug!(%id, "message arrived after its deletion");
                self.persist_mark(&id, &reason);
                Err(Error::AlreadyRemoved(id))
            }
            Step::New(message, removed) => {
                if let Some(l) = message.lamport() {
                    self.lamport.set(l);
                }
                if let Err(e) = self.messages.put(message.event()) {
                    tracing::warn!(%e, %id, "failed to persist message");
                }
                for (removed_id, reason) in &removed {
                    tracing::debug!(id = %removed_id, by = %id, "message deleted by author");
                    self.persist_mark(removed_id, reason);
                }
                self.feed
                    .publish(StoreEvent::Added {
                        message: message.clone(),
                        relay: relay.map(str::to_string),
                    })
                    .await;
                Ok(Admitted::New(message))
            }
        }
    }

    /// Stored message, unless it was never admitted or has been removed.
    pub fn get(&self, id: &EventId) -> Option<Arc<ParsedMessage>> {
        let state = self.read();
        if state.tombstones.contains_key(id) {
            return None;
        }
        state.messages.get(id).cloned()
    }

    /// Tombstone `id` locally. Idempotent. Subscribers are not notified.
    pub fn remove(&self, id: &EventId) {
        self.remove_with_reason(id, RemovalReason::UserRemoved);
    }

    /// Returns true if this call created the tombstone.
    pub fn remove_with_reason(&self, id: &EventId, reason: RemovalReason) -> bool {
        let created = {
            let mut state = self.write();
            tombstone(&mut state, *id, reason.clone())
        };
        if created {
            self.persist_mark(id, &reason);
        }
        created
    }

    pub fn removal_reason(&self, id: &EventId) -> Option<RemovalReason> {
        self.read().tombstones.get(id).cloned()
    }

    /// Snapshot of every live message, in index order. Call again to re-scan.
    pub fn enumerate(&self) -> impl Iterator<Item = Arc<ParsedMessage>> {
        let snapshot: Vec<Arc<ParsedMessage>> = self.read().messages.values().cloned().collect();
        snapshot.into_iter()
    }

    /// Independent tap on the change feed.
    pub fn subscribe(&self) -> Tap<StoreEvent> {
        self.feed.subscribe()
    }

    pub fn get_profile_by_public_key(&self, pubkey: &PublicKey) -> Option<Profile> {
        self.read().profiles.get(pubkey).cloned()
    }

    pub fn relay_records(&self, id: &EventId) -> BTreeSet<String> {
        self.read().provenance.query(id)
    }

    pub fn lamport(&self) -> &Arc<LamportClock> {
        &self.lamport
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist_mark(&self, id: &EventId, reason: &RemovalReason) {
        if let Err(e) = self.tombstones.mark_event(id, reason) {
            tracing::warn!(%e, %id, "failed to persist tombstone");
        }
    }
}

/// Insert a message that is known not to be stored or tombstoned yet.
fn index_new(state: &mut StoreState, message: Arc<ParsedMessage>) -> Indexed {
    let id = message.id();
    let author = message.author();

    if let Some(pending) = state.pending_deletions.remove(&id) {
        for (by, _) in &pending {
            if let Some(targets) = state.pending_by_author.get_mut(by) {
                targets.retain(|t| *t != id);
                if targets.is_empty() {
                    state.pending_by_author.remove(by);
                }
            }
        }
        if let Some((_, deletion)) = pending.iter().find(|(by, _)| *by == author) {
            let reason = RemovalReason::deleted_by(*deletion);
            state.tombstones.insert(id, reason.clone());
            return Indexed::Suppressed(reason);
        }
    }

    state.messages.insert(id, message.clone());

    let mut removed = Vec::new();
    match message.kind() {
        MessageKind::Profile => {
            if let Some(profile) = Profile::from_message(&message) {
                let replace = state
                    .profiles
                    .get(&author)
                    .map(|current| profile.supersedes(current))
                    .unwrap_or(true);
                if replace {
                    state.profiles.insert(author, profile);
                }
            }
        }
        MessageKind::Deletion => {
            for target in message.tags().values("e") {
                let Ok(target) = EventId::from_hex(target) else {
                    tracing::debug!(%id, target, "deletion names an unparsable id");
                    continue;
                };
                if state.tombstones.contains_key(&target) {
                    continue;
                }
                match state.messages.get(&target).map(|m| m.author()) {
                    Some(target_author) if target_author == author => {
                        let reason = RemovalReason::deleted_by(id);
                        if tombstone(state, target, reason.clone()) {
                            removed.push((target, reason));
                        }
                    }
                    Some(_) => {
                        tracing::debug!(%id, %target, "ignoring deletion of another author's message");
                    }
                    None => remember_pending_deletion(state, target, author, id),
                }
            }
        }
        _ => {}
    }

    Indexed::Stored { removed }
}

/// Keep a deletion whose target has not arrived, forgetting the author's
/// oldest pending target once they hold more than the configured bound.
fn remember_pending_deletion(
    state: &mut StoreState,
    target: EventId,
    author: PublicKey,
    deletion: EventId,
) {
    let entries = state.pending_deletions.entry(target).or_default();
    if entries.iter().any(|(by, _)| *by == author) {
        return;
    }
    entries.push((author, deletion));

    let targets = state.pending_by_author.entry(author).or_default();
    targets.push_back(target);
    if targets.len() <= state.max_pending_per_author {
        return;
    }
    let Some(oldest) = targets.pop_front() else {
        return;
    };
    tracing::debug!(%author, target = %oldest, "dropping oldest pending deletion");
    if let Some(entries) = state.pending_deletions.get_mut(&oldest) {
        entries.retain(|(by, _)| *by != author);
        if entries.is_empty() {
            state.pending_deletions.remove(&oldest);
        }
    }
}

/// Returns true if the tombstone is new.
fn tombstone(state: &mut StoreState, id: EventId, reason: RemovalReason) -> bool {
    if state.tombstones.contains_key(&id) {
        return false;
    }
    state.tombstones.insert(id, reason);
    if let Some(message) = state.messages.remove(&id) {
        let author = message.author();
        let was_current_profile = state
            .profiles
            .get(&author)
            .map(|p| p.event_id == id)
            .unwrap_or(false);
        if was_current_profile {
            state.profiles.remove(&author);
        }
    }
    true
}
