//! Direct-message pipeline: counterparty resolution, decryption, classification
//! and per-counterparty live views.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use nostr::nips::nip04;
use nostr::{Event, EventBuilder, EventId, Keys, Kind, PublicKey, Tag, Timestamp};

use crate::error::Error;
use crate::feed::{Feed, Tap, DEFAULT_FEED_CAPACITY};
use crate::lamport::{LamportClock, LAMPORT_TAG};
use crate::message::{MessageKind, ParsedMessage};
use crate::rich_text::RichText;

/// Marks a direct message whose plaintext is an image reference.
pub const IMAGE_TAG: &str = "image";

/// The other participant of a one-to-one message, seen from `me`.
///
/// Exactly one `p` tag is required. Messages neither from nor to `me` are
/// [`Error::NotMyMessage`].
pub fn resolve_counterparty(me: &PublicKey, message: &ParsedMessage) -> Result<PublicKey, Error> {
    let count = message.tags().count("p");
    if count != 1 {
        return Err(Error::InvalidMessage(format!(
            "direct message {} has {count} p tags",
            message.id()
        )));
    }
    let addressee = message
        .tags()
        .first("p")
        .ok_or_else(|| Error::InvalidMessage(format!("direct message {} has an empty p tag", message.id())))?;
    let addressee = PublicKey::from_hex(addressee)
        .map_err(|e| Error::InvalidMessage(format!("bad p tag on {}: {e}", message.id())))?;

    let author = message.author();
    if author == *me {
        Ok(addressee)
    } else if addressee == *me {
        Ok(author)
    } else {
        Err(Error::NotMyMessage)
    }
}

/// Decrypts content with the local identity's private key.
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, counterparty: &PublicKey, ciphertext: &str) -> anyhow::Result<String>;
}

pub struct Nip04Decryptor {
    keys: Keys,
}

impl Nip04Decryptor {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }
}

#[async_trait]
impl Decryptor for Nip04Decryptor {
    async fn decrypt(&self, counterparty: &PublicKey, ciphertext: &str) -> anyhow::Result<String> {
        let plaintext = nip04::decrypt(self.keys.secret_key(), counterparty, ciphertext)?;
        Ok(plaintext)
    }
}

/// Compose a signed, encrypted direct message from `keys` to `to`.
pub fn build_direct_message(
    keys: &Keys,
    to: &PublicKey,
    plaintext: &str,
    image: bool,
    clock: &LamportClock,
) -> anyhow::Result<Event> {
    let ciphertext =
        nip04::encrypt(keys.secret_key(), to, plaintext).context("encrypt direct message")?;
    let mut tags = vec![Tag::public_key(*to)];
    if image {
        tags.push(Tag::parse(vec![IMAGE_TAG.to_string()])?);
    }
    tags.push(Tag::parse(vec![
        LAMPORT_TAG.to_string(),
        clock.now().to_string(),
    ])?);
    let event = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
        .tags(tags)
        .sign_with_keys(keys)
        .context("sign direct message")?;
    Ok(event)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatContent {
    Text(String),
    Image(String),
}

/// Decrypted, classified view of one direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: EventId,
    pub author: PublicKey,
    pub counterparty: PublicKey,
    pub created_at: Timestamp,
    pub lamport: Option<u64>,
    pub outgoing: bool,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn is_image(&self) -> bool {
        matches!(self.content, ChatContent::Image(_))
    }

    /// Rich text tokens; `None` for image messages.
    pub fn rich_text(&self) -> Option<RichText<'_>> {
        match &self.content {
            ChatContent::Text(text) => Some(RichText::parse(text)),
            ChatContent::Image(_) => None,
        }
    }
}

/// Pairwise display order.
///
/// Lamport values decide only when both sides carry one; otherwise the
/// wall-clock timestamp does. Remaining ties fall to timestamp, then id.
pub fn display_order(a: &ChatMessage, b: &ChatMessage) -> Ordering {
    let primary = match (a.lamport, b.lamport) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.created_at.cmp(&b.created_at),
    };
    primary
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort a conversation for display.
///
/// Pairwise [`display_order`] is not transitive across a mix of messages with
/// and without Lamport values, so a collection is ordered by Lamport only when
/// every member has one.
pub fn sort_for_display(messages: &mut [ChatMessage]) {
    let by_lamport = messages.iter().all(|m| m.lamport.is_some());
    messages.sort_by_key(|m| display_key(m, by_lamport));
}

fn display_key(m: &ChatMessage, by_lamport: bool) -> (u64, Timestamp, EventId) {
    let lamport = if by_lamport {
        m.lamport.unwrap_or_default()
    } else {
        0
    };
    (lamport, m.created_at, m.id)
}

/// One conversation's history, kept in display order as messages arrive.
struct Thread {
    ids: HashSet<EventId>,
    /// Every message so far carries a Lamport value.
    by_lamport: bool,
    messages: Vec<ChatMessage>,
}

impl Default for Thread {
    fn default() -> Self {
        Self {
            ids: HashSet::new(),
            by_lamport: true,
            messages: Vec::new(),
        }
    }
}

impl Thread {
    /// Returns false for an id already in the thread.
    fn insert(&mut self, chat: ChatMessage) -> bool {
        if !self.ids.insert(chat.id) {
            return false;
        }
        if self.by_lamport && chat.lamport.is_none() {
            // Happens at most once per thread.
            self.by_lamport = false;
            self.messages.push(chat);
            sort_for_display(&mut self.messages);
            return true;
        }
        let by_lamport = self.by_lamport;
        let key = display_key(&chat, by_lamport);
        let at = self
            .messages
            .partition_point(|m| display_key(m, by_lamport) < key);
        self.messages.insert(at, chat);
        true
    }
}

pub struct DmPipeline {
    me: PublicKey,
    decryptor: Arc<dyn Decryptor>,
    feed: Feed<ChatMessage>,
    history: RwLock<HashMap<PublicKey, Thread>>,
}

impl DmPipeline {
    pub fn new(me: PublicKey, decryptor: Arc<dyn Decryptor>) -> Self {
        Self::with_capacity(me, decryptor, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(me: PublicKey, decryptor: Arc<dyn Decryptor>, capacity: usize) -> Self {
        Self {
            me,
            decryptor,
            feed: Feed::new("dm", capacity),
            history: RwLock::new(HashMap::new()),
        }
    }

    pub fn me(&self) -> PublicKey {
        self.me
    }

    /// Run one admitted message through resolve, decrypt, classify and
    /// materialize. Each message id is published at most once.
    pub async fn process(&self, message: &ParsedMessage) -> Result<ChatMessage, Error> {
        if message.kind() != MessageKind::DirectMessage {
            return Err(Error::InvalidMessage(format!(
                "{} is not a direct message",
                message.id()
            )));
        }
        let counterparty = resolve_counterparty(&self.me, message)?;
        let plaintext = self
            .decryptor
            .decrypt(&counterparty, message.content())
            .await
            .map_err(|e| Error::DecryptionFailed {
                id: message.id(),
                reason: e.to_string(),
            })?;

        let content = if message.tags().contains(IMAGE_TAG) {
            ChatContent::Image(plaintext)
        } else {
            ChatContent::Text(plaintext)
        };
        let chat = ChatMessage {
            id: message.id(),
            author: message.author(),
            counterparty,
            created_at: message.created_at(),
            lamport: message.lamport(),
            outgoing: message.author() == self.me,
            content,
        };

        let is_new = {
            let mut history = match self.history.write() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            history
                .entry(counterparty)
                .or_default()
                .insert(chat.clone())
        };
        if is_new {
            self.feed.publish(chat.clone()).await;
        }
        Ok(chat)
    }

    /// Every materialized message, in processing order.
    pub fn subscribe(&self) -> Tap<ChatMessage> {
        self.feed.subscribe()
    }

    /// Live view of one conversation, derived by filtering the shared feed.
    pub fn subscribe_counterparty(
        &self,
        counterparty: PublicKey,
    ) -> impl Stream<Item = ChatMessage> + Send + 'static {
        self.feed
            .subscribe()
            .into_stream()
            .filter(move |m| future::ready(m.counterparty == counterparty))
    }

    /// Conversation history with `counterparty`, in display order.
    pub fn messages_with(&self, counterparty: &PublicKey) -> Vec<ChatMessage> {
        let history = match self.history.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        history
            .get(counterparty)
            .map(|thread| thread.messages.clone())
            .unwrap_or_default()
    }

    /// Whether `id` made it into a conversation history.
    pub fn contains(&self, counterparty: &PublicKey, id: &EventId) -> bool {
        let history = match self.history.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        history
            .get(counterparty)
            .is_some_and(|thread| thread.ids.contains(id))
    }
}
