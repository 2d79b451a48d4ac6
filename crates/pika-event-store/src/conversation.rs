//! Per-counterparty conversation summaries derived from admitted direct messages.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nostr::{EventId, PublicKey};

use crate::dm::resolve_counterparty;
use crate::error::Error;
use crate::message::{MessageKind, ParsedMessage};
use crate::storage::BlockList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Messages flowed both ways.
    Contacts,
    /// Only one direction so far.
    Strangers,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub pubkey: PublicKey,
    pub newest_sent: Option<Arc<ParsedMessage>>,
    pub newest_received: Option<Arc<ParsedMessage>>,
    pub relays: BTreeSet<String>,
    pub unread: u32,
    pub pinned: bool,
    /// Block list state when this snapshot was taken.
    pub blocked: bool,
}

impl ConversationSummary {
    fn new(pubkey: PublicKey) -> Self {
        Self {
            pubkey,
            newest_sent: None,
            newest_received: None,
            relays: BTreeSet::new(),
            unread: 0,
            pinned: false,
            blocked: false,
        }
    }

    pub fn classification(&self) -> Classification {
        if self.blocked {
            Classification::Blocked
        } else if self.newest_sent.is_some() && self.newest_received.is_some() {
            Classification::Contacts
        } else {
            Classification::Strangers
        }
    }

    /// Sum of the newest timestamps in both directions.
    pub fn sort_key(&self) -> u64 {
        [&self.newest_sent, &self.newest_received]
            .into_iter()
            .flatten()
            .map(|m| m.created_at().as_secs())
            .sum()
    }

    /// Newest message in either direction.
    pub fn last_message(&self) -> Option<&Arc<ParsedMessage>> {
        [&self.newest_sent, &self.newest_received]
            .into_iter()
            .flatten()
            .max_by_key(|m| (m.created_at(), m.id()))
    }
}

/// What one [`ConversationIndex::add_messages`] call did.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub updated: usize,
    /// Already indexed, not a direct message, or not addressed to us.
    pub ignored: usize,
    pub invalid: Vec<(EventId, Error)>,
}

#[derive(Default)]
struct IndexState {
    summaries: HashMap<PublicKey, ConversationSummary>,
    /// Indexed message ids, and whether each arrived as a live update.
    seen: HashMap<EventId, bool>,
}

pub struct ConversationIndex {
    me: PublicKey,
    block_list: Arc<dyn BlockList>,
    state: RwLock<IndexState>,
}

impl ConversationIndex {
    pub fn new(me: PublicKey, block_list: Arc<dyn BlockList>) -> Self {
        Self {
            me,
            block_list,
            state: RwLock::new(IndexState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        match self.state.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        match self.state.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Fold a batch of admitted messages into the summaries.
    ///
    /// Messages are idempotent by id. Live updates authored by someone else
    /// count as unread. A message first indexed from the backlog and then
    /// delivered live was admitted while the backlog was being read; it
    /// counts as unread once.
    pub fn add_messages<I>(&self, batch: I, is_live_update: bool) -> BatchOutcome
    where
        I: IntoIterator<Item = Arc<ParsedMessage>>,
    {
        let mut outcome = BatchOutcome::default();
        let mut state = self.write();
        for message in batch {
            if message.kind() != MessageKind::DirectMessage {
                outcome.ignored += 1;
                continue;
            }
            let was_live = state.seen.get(&message.id()).copied();
            match was_live {
                Some(true) => {
                    outcome.ignored += 1;
                    continue;
                }
                Some(false) if !is_live_update => {
                    outcome.ignored += 1;
                    continue;
                }
                _ => {}
            }
            let counterparty = match resolve_counterparty(&self.me, &message) {
                Ok(pk) => pk,
                Err(Error::NotMyMessage) => {
                    tracing::debug!(id = %message.id(), "ignoring direct message for someone else");
                    outcome.ignored += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%e, id = %message.id(), "dropping malformed direct message");
                    outcome.invalid.push((message.id(), e));
                    continue;
                }
            };

            state.seen.insert(message.id(), is_live_update);
            let outgoing = message.author() == self.me;
            let summary = state
                .summaries
                .entry(counterparty)
                .or_insert_with(|| ConversationSummary::new(counterparty));
            if was_live.is_some() {
                if !outgoing {
                    summary.unread = summary.unread.saturating_add(1);
                    outcome.updated += 1;
                } else {
                    outcome.ignored += 1;
                }
                continue;
            }
            let slot = if outgoing {
                &mut summary.newest_sent
            } else {
                &mut summary.newest_received
            };
            let newer = slot
                .as_ref()
                .map(|cur| (message.created_at(), message.id()) > (cur.created_at(), cur.id()))
                .unwrap_or(true);
            if newer {
                *slot = Some(message.clone());
            }
            if is_live_update && !outgoing {
                summary.unread = summary.unread.saturating_add(1);
            }
            outcome.updated += 1;
        }
        outcome
    }

    /// Add `relay` to the conversation `message` belongs to. Returns false when
    /// that conversation is not indexed.
    pub fn record_relay(&self, message: &ParsedMessage, relay: &str) -> bool {
        let Ok(counterparty) = resolve_counterparty(&self.me, message) else {
            return false;
        };
        match self.write().summaries.get_mut(&counterparty) {
            Some(summary) => {
                summary.relays.insert(relay.to_string());
                true
            }
            None => false,
        }
    }

    pub fn mark_read(&self, pubkey: &PublicKey) {
        if let Some(summary) = self.write().summaries.get_mut(pubkey) {
            summary.unread = 0;
        }
    }

    pub fn pin(&self, pubkey: &PublicKey) -> bool {
        self.set_pinned(pubkey, true)
    }

    pub fn unpin(&self, pubkey: &PublicKey) -> bool {
        self.set_pinned(pubkey, false)
    }

    fn set_pinned(&self, pubkey: &PublicKey, pinned: bool) -> bool {
        match self.write().summaries.get_mut(pubkey) {
            Some(summary) => {
                summary.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn block(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.block_list.block(pubkey)
    }

    pub fn unblock(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.block_list.unblock(pubkey)
    }

    pub fn get(&self, pubkey: &PublicKey) -> Option<ConversationSummary> {
        let summary = self.read().summaries.get(pubkey).cloned()?;
        Some(self.with_block_state(summary))
    }

    fn with_block_state(&self, mut summary: ConversationSummary) -> ConversationSummary {
        summary.blocked = self.block_list.is_blocked(&summary.pubkey);
        summary
    }

    /// Snapshot of every summary with block state applied. Each call re-scans.
    fn snapshot(&self) -> std::vec::IntoIter<ConversationSummary> {
        let summaries: Vec<ConversationSummary> = self.read().summaries.values().cloned().collect();
        summaries
            .into_iter()
            .map(|s| self.with_block_state(s))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn classified(&self, class: Classification) -> impl Iterator<Item = ConversationSummary> {
        self.snapshot().filter(move |s| s.classification() == class)
    }

    pub fn get_contacts(&self) -> impl Iterator<Item = ConversationSummary> {
        self.classified(Classification::Contacts)
    }

    pub fn get_strangers(&self) -> impl Iterator<Item = ConversationSummary> {
        self.classified(Classification::Strangers)
    }

    pub fn get_blocked(&self) -> impl Iterator<Item = ConversationSummary> {
        self.classified(Classification::Blocked)
    }

    /// Known, unblocked conversations among `keys`.
    pub fn get_conversations<'a>(
        &'a self,
        keys: &'a [PublicKey],
    ) -> impl Iterator<Item = ConversationSummary> + 'a {
        keys.iter()
            .filter_map(|pk| self.get(pk))
            .filter(|s| !s.blocked)
    }

    /// Unblocked conversations, most recently active first.
    pub fn get_conversation_list(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> = self.snapshot().filter(|s| !s.blocked).collect();
        list.sort_by(|a, b| {
            b.sort_key()
                .cmp(&a.sort_key())
                .then_with(|| a.pubkey.cmp(&b.pubkey))
        });
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDb;
    use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};

    struct Fixture {
        me: Keys,
        index: ConversationIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let me = Keys::generate();
            let index = ConversationIndex::new(me.public_key(), Arc::new(MemoryDb::new()));
            Self { me, index }
        }

        // The index never decrypts, so the content is left opaque.
        fn dm(&self, from: &Keys, to: &PublicKey, at: u64) -> Arc<ParsedMessage> {
            let ev = EventBuilder::new(Kind::EncryptedDirectMessage, "ciphertext")
                .tags(vec![Tag::public_key(*to)])
                .custom_created_at(Timestamp::from_secs(at))
                .sign_with_keys(from)
                .unwrap();
            Arc::new(ParsedMessage::new(ev))
        }

        fn sent(&self, to: &Keys, at: u64) -> Arc<ParsedMessage> {
            self.dm(&self.me, &to.public_key(), at)
        }

        fn received(&self, from: &Keys, at: u64) -> Arc<ParsedMessage> {
            self.dm(from, &self.me.public_key(), at)
        }
    }

    #[test]
    fn classification_follows_direction_then_block_list() {
        let f = Fixture::new();
        let bob = Keys::generate();

        f.index.add_messages([f.sent(&bob, 10)], false);
        assert_eq!(
            f.index.get(&bob.public_key()).unwrap().classification(),
            Classification::Strangers
        );
        assert_eq!(f.index.get_strangers().count(), 1);

        f.index.add_messages([f.received(&bob, 11)], false);
        assert_eq!(
            f.index.get(&bob.public_key()).unwrap().classification(),
            Classification::Contacts
        );
        assert_eq!(f.index.get_contacts().count(), 1);
        assert_eq!(f.index.get_strangers().count(), 0);

        f.index.block(&bob.public_key()).unwrap();
        assert_eq!(
            f.index.get(&bob.public_key()).unwrap().classification(),
            Classification::Blocked
        );
        assert_eq!(f.index.get_contacts().count(), 0);
        assert_eq!(f.index.get_blocked().count(), 1);
        assert!(f.index.get_conversation_list().is_empty());

        f.index.unblock(&bob.public_key()).unwrap();
        assert_eq!(f.index.get_contacts().count(), 1);
    }

    #[test]
    fn keeps_newest_per_direction_in_any_order() {
        let f = Fixture::new();
        let bob = Keys::generate();
        let old = f.received(&bob, 5);
        let new = f.received(&bob, 50);

        f.index.add_messages([new.clone(), old], false);
        let summary = f.index.get(&bob.public_key()).unwrap();
        assert_eq!(summary.newest_received.unwrap().id(), new.id());
        assert!(summary.newest_sent.is_none());
    }

    #[test]
    fn live_received_messages_count_as_unread() {
        let f = Fixture::new();
        let bob = Keys::generate();
        let first = f.received(&bob, 1);

        f.index.add_messages([f.received(&bob, 0)], false);
        f.index.add_messages([first.clone(), f.sent(&bob, 2)], true);
        f.index.add_messages([first], true);
        assert_eq!(f.index.get(&bob.public_key()).unwrap().unread, 1);

        f.index.mark_read(&bob.public_key());
        assert_eq!(f.index.get(&bob.public_key()).unwrap().unread, 0);
    }

    #[test]
    fn backlog_message_delivered_live_counts_once() {
        let f = Fixture::new();
        let bob = Keys::generate();
        let raced = f.received(&bob, 7);
        let mine = f.sent(&bob, 8);

        f.index.add_messages([raced.clone(), mine.clone()], false);
        assert_eq!(f.index.get(&bob.public_key()).unwrap().unread, 0);

        let outcome = f.index.add_messages([raced.clone(), mine], true);
        assert_eq!(outcome.updated, 1);
        assert_eq!(f.index.get(&bob.public_key()).unwrap().unread, 1);

        f.index.add_messages([raced.clone()], true);
        f.index.add_messages([raced], false);
        assert_eq!(f.index.get(&bob.public_key()).unwrap().unread, 1);
    }

    #[test]
    fn foreign_and_malformed_messages_are_not_indexed() {
        let f = Fixture::new();
        let (a, b) = (Keys::generate(), Keys::generate());
        let foreign = f.dm(&a, &b.public_key(), 1);
        let malformed = Arc::new(ParsedMessage::new(
            EventBuilder::new(Kind::EncryptedDirectMessage, "x")
                .tags(vec![
                    Tag::public_key(f.me.public_key()),
                    Tag::public_key(b.public_key()),
                ])
                .sign_with_keys(&a)
                .unwrap(),
        ));
        let note = Arc::new(ParsedMessage::new(
            EventBuilder::new(Kind::TextNote, "public")
                .sign_with_keys(&a)
                .unwrap(),
        ));

        let outcome = f.index.add_messages([foreign, malformed.clone(), note], true);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.ignored, 2);
        assert_eq!(outcome.invalid.len(), 1);
        assert_eq!(outcome.invalid[0].0, malformed.id());
        assert_eq!(f.index.get_conversation_list().len(), 0);
    }

    #[test]
    fn list_sorts_by_summed_recency() {
        let f = Fixture::new();
        let (bob, carol) = (Keys::generate(), Keys::generate());
        // bob: 100 + 0, carol: 60 + 70
        f.index.add_messages([f.sent(&bob, 100)], false);
        f.index
            .add_messages([f.sent(&carol, 60), f.received(&carol, 70)], false);

        let order: Vec<PublicKey> = f
            .index
            .get_conversation_list()
            .into_iter()
            .map(|s| s.pubkey)
            .collect();
        assert_eq!(order, vec![carol.public_key(), bob.public_key()]);

        let keys = [bob.public_key(), Keys::generate().public_key()];
        assert_eq!(f.index.get_conversations(&keys).count(), 1);
    }

    #[test]
    fn relays_and_pins_attach_to_known_conversations() {
        let f = Fixture::new();
        let bob = Keys::generate();
        let msg = f.received(&bob, 1);
        assert!(!f.index.record_relay(&msg, "wss://early"));
        assert!(!f.index.pin(&bob.public_key()));

        f.index.add_messages([msg.clone()], false);
        assert!(f.index.record_relay(&msg, "wss://one"));
        assert!(f.index.record_relay(&msg, "wss://two"));
        assert!(f.index.pin(&bob.public_key()));

        let summary = f.index.get(&bob.public_key()).unwrap();
        assert_eq!(summary.relays.len(), 2);
        assert!(summary.pinned);
        assert_eq!(summary.last_message().map(|m| m.id()), Some(msg.id()));

        f.index.unpin(&bob.public_key());
        assert!(!f.index.get(&bob.public_key()).unwrap().pinned);
    }
}
