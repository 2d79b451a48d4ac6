//! Message model: the signed protocol event plus a read-only parsed projection.

use std::collections::HashMap;

use nostr::{Event, EventId, JsonUtil, Kind, PublicKey, Timestamp};

use crate::error::Error;
use crate::lamport::{LAMPORT_TAG, MAX_OBSERVED};

/// Generic application data (NIP-78).
pub const APP_DATA_KIND: u16 = 30_078;

/// Logical kind of a message as far as this crate cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Profile,
    PublicNote,
    DirectMessage,
    Deletion,
    Reaction,
    AppData,
    Other(u16),
}

impl From<Kind> for MessageKind {
    fn from(kind: Kind) -> Self {
        match kind.as_u16() {
            0 => MessageKind::Profile,
            1 => MessageKind::PublicNote,
            4 => MessageKind::DirectMessage,
            5 => MessageKind::Deletion,
            7 => MessageKind::Reaction,
            APP_DATA_KIND => MessageKind::AppData,
            other => MessageKind::Other(other),
        }
    }
}

/// A message as it reaches the ingestion boundary.
///
/// Relays hand over JSON text, local code usually has a typed event already.
/// The variant is resolved once in [`Incoming::into_event`].
#[derive(Debug, Clone)]
pub enum Incoming {
    Raw(String),
    Parsed(Event),
}

impl Incoming {
    pub fn into_event(self) -> Result<Event, Error> {
        match self {
            Incoming::Parsed(event) => Ok(event),
            Incoming::Raw(json) => {
                Event::from_json(json.as_str()).map_err(|e| Error::InvalidMessage(e.to_string()))
            }
        }
    }
}

impl From<Event> for Incoming {
    fn from(event: Event) -> Self {
        Incoming::Parsed(event)
    }
}

impl From<String> for Incoming {
    fn from(json: String) -> Self {
        Incoming::Raw(json)
    }
}

impl From<&str> for Incoming {
    fn from(json: &str) -> Self {
        Incoming::Raw(json.to_string())
    }
}

/// Tag rows grouped by tag name, in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagIndex {
    by_name: HashMap<String, Vec<Vec<String>>>,
}

impl TagIndex {
    pub fn from_event(event: &Event) -> Self {
        let mut by_name: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for tag in event.tags.iter() {
            let fields = tag.as_slice();
            let Some(name) = fields.first() else {
                continue;
            };
            by_name
                .entry(name.clone())
                .or_default()
                .push(fields[1..].to_vec());
        }
        Self { by_name }
    }

    /// Values (everything after the tag name) of every tag called `name`.
    pub fn rows<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.by_name
            .get(name)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|r| r.as_slice()))
    }

    /// First value of every tag called `name`.
    pub fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.rows(name)
            .filter_map(|row| row.first().map(|v| v.as_str()))
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).next()
    }

    pub fn count(&self, name: &str) -> usize {
        self.by_name.get(name).map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.count(name) > 0
    }
}

/// An admitted message plus its derived tag index.
///
/// Parsing never touches the underlying event; everything here is a projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    event: Event,
    tags: TagIndex,
    kind: MessageKind,
    lamport: Option<u64>,
}

impl ParsedMessage {
    pub fn new(event: Event) -> Self {
        let tags = TagIndex::from_event(&event);
        let kind = MessageKind::from(event.kind);
        let lamport = tags
            .first(LAMPORT_TAG)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v <= MAX_OBSERVED);
        Self {
            event,
            tags,
            kind,
            lamport,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn id(&self) -> EventId {
        self.event.id
    }

    pub fn author(&self) -> PublicKey {
        self.event.pubkey
    }

    pub fn created_at(&self) -> Timestamp {
        self.event.created_at
    }

    pub fn content(&self) -> &str {
        &self.event.content
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    pub fn lamport(&self) -> Option<u64> {
        self.lamport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag};

    fn event_with_tags(kind: Kind, tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(kind, "body")
            .tags(tags)
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn kinds_map_to_logical_kinds() {
        assert_eq!(MessageKind::from(Kind::Metadata), MessageKind::Profile);
        assert_eq!(MessageKind::from(Kind::TextNote), MessageKind::PublicNote);
        assert_eq!(
            MessageKind::from(Kind::EncryptedDirectMessage),
            MessageKind::DirectMessage
        );
        assert_eq!(MessageKind::from(Kind::EventDeletion), MessageKind::Deletion);
        assert_eq!(MessageKind::from(Kind::Reaction), MessageKind::Reaction);
        assert_eq!(
            MessageKind::from(Kind::Custom(APP_DATA_KIND)),
            MessageKind::AppData
        );
        assert_eq!(
            MessageKind::from(Kind::Custom(20_067)),
            MessageKind::Other(20_067)
        );
    }

    #[test]
    fn tag_index_groups_rows_in_order() {
        let ev = event_with_tags(
            Kind::TextNote,
            vec![
                Tag::parse(vec!["e", "first"]).unwrap(),
                Tag::parse(vec!["k", "9"]).unwrap(),
                Tag::parse(vec!["e", "second", "wss://relay.example"]).unwrap(),
            ],
        );
        let parsed = ParsedMessage::new(ev);
        let values: Vec<&str> = parsed.tags().values("e").collect();
        assert_eq!(values, vec!["first", "second"]);
        assert_eq!(parsed.tags().count("e"), 2);
        assert_eq!(parsed.tags().first("k"), Some("9"));
        assert!(!parsed.tags().contains("p"));
        let rows: Vec<&[String]> = parsed.tags().rows("e").collect();
        assert_eq!(rows[1].len(), 2);
    }

    #[test]
    fn lamport_tag_is_read_when_numeric() {
        let ev = event_with_tags(
            Kind::EncryptedDirectMessage,
            vec![Tag::parse(vec![LAMPORT_TAG, "17"]).unwrap()],
        );
        assert_eq!(ParsedMessage::new(ev).lamport(), Some(17));

        let ev = event_with_tags(
            Kind::EncryptedDirectMessage,
            vec![Tag::parse(vec![LAMPORT_TAG, "soon"]).unwrap()],
        );
        assert_eq!(ParsedMessage::new(ev).lamport(), None);

        let ev = event_with_tags(
            Kind::EncryptedDirectMessage,
            vec![Tag::parse(vec![LAMPORT_TAG, "18446744073709551615"]).unwrap()],
        );
        assert_eq!(ParsedMessage::new(ev).lamport(), None);
    }

    #[test]
    fn parsing_leaves_event_untouched() {
        let ev = event_with_tags(Kind::TextNote, vec![Tag::parse(vec!["t", "news"]).unwrap()]);
        let parsed = ParsedMessage::new(ev.clone());
        assert_eq!(parsed.event(), &ev);
        assert_eq!(parsed.id(), ev.id);
        assert_eq!(parsed.author(), ev.pubkey);
    }

    #[test]
    fn raw_incoming_parses_once() {
        let ev = event_with_tags(Kind::TextNote, vec![]);
        let raw = Incoming::from(ev.as_json());
        assert_eq!(raw.into_event().unwrap(), ev);

        let garbage = Incoming::from("{not json");
        assert!(matches!(
            garbage.into_event(),
            Err(Error::InvalidMessage(_))
        ));
    }
}
