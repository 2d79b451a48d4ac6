//! `ChatCore`: the store plus its derived views, kept current by one worker.
//!
//! The worker is the only writer of the decryption history and the conversation
//! index. It consumes the store feed in order, so derived state never races
//! with itself; readers take snapshots.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use nostr::{EventId, Keys, PublicKey};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::load_config;
use crate::conversation::{ConversationIndex, ConversationSummary};
use crate::dm::{resolve_counterparty, ChatMessage, Decryptor, DmPipeline, Nip04Decryptor};
use crate::error::Error;
use crate::feed::{Feed, Tap};
use crate::message::{Incoming, MessageKind, ParsedMessage};
use crate::profile::Profile;
use crate::sqlite_db::SqliteDb;
use crate::storage::BlockList;
use crate::store::{Admitted, EventStore, StoreEvent};

/// One delivery from the network layer.
pub type Delivery = (Incoming, Option<String>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub new: usize,
    pub duplicates: usize,
    pub removed: usize,
    pub rejected: usize,
}

struct Shared {
    store: Arc<EventStore>,
    dm: DmPipeline,
    conversations: ConversationIndex,
    changes: Feed<PublicKey>,
}

pub struct ChatCore {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
    backfilled: watch::Receiver<bool>,
}

impl ChatCore {
    /// Start the worker on the current tokio runtime. Direct messages already
    /// in `store` are folded in first, without counting as unread.
    pub fn start(
        store: Arc<EventStore>,
        me: PublicKey,
        decryptor: Arc<dyn Decryptor>,
        block_list: Arc<dyn BlockList>,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            dm: DmPipeline::new(me, decryptor),
            conversations: ConversationIndex::new(me, block_list),
            changes: Feed::new("conversations", 1024),
        });
        // Subscribe before the backlog snapshot so nothing admitted in between
        // is lost. The snapshot is taken here, not in the worker, so anything
        // admitted after `start` returns arrives as a live update.
        let tap = shared.store.subscribe();
        let backlog: Vec<Arc<ParsedMessage>> = shared
            .store
            .enumerate()
            .filter(|m| m.kind() == MessageKind::DirectMessage)
            .collect();
        let (backfill_tx, backfilled) = watch::channel(false);
        let worker = tokio::spawn(run_worker(shared.clone(), backlog, tap, backfill_tx));
        Self {
            shared,
            worker,
            backfilled,
        }
    }

    /// Resolves once messages that were already stored at start are indexed.
    pub async fn ready(&self) {
        let mut rx = self.backfilled.clone();
        if rx.wait_for(|done| *done).await.is_err() {
            tracing::error!("impossible state: chat worker exited before backfill");
        }
    }

    /// SQLite-backed core for `keys` under `data_dir`, configured from
    /// `pika_store_config.json` in that directory.
    pub fn open(data_dir: &Path, keys: Keys) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = load_config(data_dir);
        let db = Arc::new(SqliteDb::open(data_dir)?);
        let store = Arc::new(EventStore::with_backend(db.clone(), &config));
        let me = keys.public_key();
        Ok(Self::start(
            store,
            me,
            Arc::new(Nip04Decryptor::new(keys)),
            db,
        ))
    }

    pub fn me(&self) -> PublicKey {
        self.shared.dm.me()
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.shared.store
    }

    pub async fn admit(
        &self,
        incoming: impl Into<Incoming>,
        relay: Option<&str>,
    ) -> Result<Admitted, Error> {
        self.shared.store.admit(incoming, relay).await
    }

    pub fn get(&self, id: &EventId) -> Option<Arc<ParsedMessage>> {
        self.shared.store.get(id)
    }

    pub fn remove(&self, id: &EventId) {
        self.shared.store.remove(id)
    }

    pub fn enumerate(&self) -> impl Iterator<Item = Arc<ParsedMessage>> {
        self.shared.store.enumerate()
    }

    pub fn subscribe(&self) -> Tap<StoreEvent> {
        self.shared.store.subscribe()
    }

    pub fn relay_records(&self, id: &EventId) -> BTreeSet<String> {
        self.shared.store.relay_records(id)
    }

    pub fn get_profile_by_public_key(&self, pubkey: &PublicKey) -> Option<Profile> {
        self.shared.store.get_profile_by_public_key(pubkey)
    }

    /// Decrypted messages as the worker materializes them.
    pub fn subscribe_messages(&self) -> Tap<ChatMessage> {
        self.shared.dm.subscribe()
    }

    pub fn subscribe_counterparty(
        &self,
        counterparty: PublicKey,
    ) -> impl Stream<Item = ChatMessage> + Send + 'static {
        self.shared.dm.subscribe_counterparty(counterparty)
    }

    /// Counterparty keys whose summary the worker just changed.
    pub fn subscribe_conversations(&self) -> Tap<PublicKey> {
        self.shared.changes.subscribe()
    }

    pub fn messages_with(&self, counterparty: &PublicKey) -> Vec<ChatMessage> {
        self.shared.dm.messages_with(counterparty)
    }

    pub fn get_conversation(&self, pubkey: &PublicKey) -> Option<ConversationSummary> {
        self.shared.conversations.get(pubkey)
    }

    pub fn get_conversation_list(&self) -> Vec<ConversationSummary> {
        self.shared.conversations.get_conversation_list()
    }

    pub fn get_contacts(&self) -> impl Iterator<Item = ConversationSummary> {
        self.shared.conversations.get_contacts()
    }

    pub fn get_strangers(&self) -> impl Iterator<Item = ConversationSummary> {
        self.shared.conversations.get_strangers()
    }

    pub fn get_blocked(&self) -> impl Iterator<Item = ConversationSummary> {
        self.shared.conversations.get_blocked()
    }

    pub fn get_conversations(&self, keys: &[PublicKey]) -> Vec<ConversationSummary> {
        self.shared.conversations.get_conversations(keys).collect()
    }

    pub fn mark_read(&self, pubkey: &PublicKey) {
        self.shared.conversations.mark_read(pubkey)
    }

    pub fn pin(&self, pubkey: &PublicKey) -> bool {
        self.shared.conversations.pin(pubkey)
    }

    pub fn unpin(&self, pubkey: &PublicKey) -> bool {
        self.shared.conversations.unpin(pubkey)
    }

    pub fn block(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.shared.conversations.block(pubkey)
    }

    pub fn unblock(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.shared.conversations.unblock(pubkey)
    }

    /// Admit deliveries until every sender is dropped. Relay connections each
    /// hold a sender; this is the single funnel into [`EventStore::admit`].
    pub async fn ingest(&self, deliveries: flume::Receiver<Delivery>) -> IngestStats {
        let mut stats = IngestStats::default();
        while let Ok((incoming, relay)) = deliveries.recv_async().await {
            match self.admit(incoming, relay.as_deref()).await {
                Ok(Admitted::New(_)) => stats.new += 1,
                Ok(Admitted::Duplicate { .. }) => stats.duplicates += 1,
                Err(Error::AlreadyRemoved(_)) => stats.removed += 1,
                Err(e) => {
                    tracing::warn!(%e, relay = ?relay, "rejected delivery");
                    stats.rejected += 1;
                }
            }
        }
        tracing::info!(
            new = stats.new,
            duplicates = stats.duplicates,
            removed = stats.removed,
            rejected = stats.rejected,
            "ingest finished"
        );
        stats
    }
}

impl Drop for ChatCore {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    backlog: Vec<Arc<ParsedMessage>>,
    tap: Tap<StoreEvent>,
    backfilled: watch::Sender<bool>,
) {
    for message in backlog {
        shared.apply(&message, false).await;
    }
    backfilled.send_replace(true);

    while let Some(event) = tap.recv().await {
        match event {
            StoreEvent::Added { message, .. } => {
                if message.kind() == MessageKind::DirectMessage {
                    shared.apply(&message, true).await;
                }
            }
            StoreEvent::RelayConfirmed { message, relay } => {
                if message.kind() != MessageKind::DirectMessage {
                    continue;
                }
                let Ok(pk) = resolve_counterparty(&shared.dm.me(), &message) else {
                    continue;
                };
                // Relays that only delivered messages kept out of the views
                // are not part of the conversation.
                if !shared.dm.contains(&pk, &message.id()) {
                    continue;
                }
                if shared.conversations.record_relay(&message, &relay) {
                    shared.changes.publish(pk).await;
                }
            }
        }
    }
}

impl Shared {
    async fn apply(&self, message: &Arc<ParsedMessage>, live: bool) {
        let chat = match self.dm.process(message).await {
            Ok(chat) => chat,
            Err(e) if e.is_benign() => {
                tracing::debug!(%e, id = %message.id(), "skipping direct message");
                return;
            }
            Err(e) => {
                tracing::warn!(%e, id = %message.id(), "direct message kept out of conversations");
                return;
            }
        };

        let outcome = self.conversations.add_messages([message.clone()], live);
        for url in self.store.relay_records(&message.id()) {
            self.conversations.record_relay(message, &url);
        }
        if outcome.updated > 0 {
            self.changes.publish(chat.counterparty).await;
        }
    }
}
