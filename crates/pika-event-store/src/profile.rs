use nostr::{EventId, JsonUtil, Metadata, PublicKey, Timestamp};

use crate::message::ParsedMessage;

/// Latest profile message for one author, materialized.
///
/// A newer profile replaces the whole value; fields are never merged across
/// versions.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub pubkey: PublicKey,
    pub event_id: EventId,
    pub created_at: Timestamp,
    pub metadata: Metadata,
}

impl Profile {
    /// `None` when the content is not metadata JSON.
    pub fn from_message(message: &ParsedMessage) -> Option<Self> {
        let metadata = match Metadata::from_json(message.content()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%e, id = %message.id(), "ignoring profile with unparsable metadata");
                return None;
            }
        };
        Some(Self {
            pubkey: message.author(),
            event_id: message.id(),
            created_at: message.created_at(),
            metadata,
        })
    }

    /// Newer timestamp wins; on a tie the lower event id wins.
    pub fn supersedes(&self, current: &Profile) -> bool {
        match self.created_at.cmp(&current.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.event_id < current.event_id,
        }
    }

    /// Display name, falling back to the handle.
    pub fn name(&self) -> Option<&str> {
        self.metadata
            .display_name
            .as_deref()
            .or(self.metadata.name.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn picture_url(&self) -> Option<&str> {
        self.metadata
            .picture
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn profile_msg(keys: &Keys, json: &str, at: u64) -> ParsedMessage {
        let ev = EventBuilder::new(Kind::Metadata, json)
            .custom_created_at(Timestamp::from_secs(at))
            .sign_with_keys(keys)
            .unwrap();
        ParsedMessage::new(ev)
    }

    #[test]
    fn name_prefers_display_name() {
        let keys = Keys::generate();
        let p = Profile::from_message(&profile_msg(
            &keys,
            r#"{"display_name":"Alice","name":"alice","picture":"https://example.com/a.jpg"}"#,
            1,
        ))
        .unwrap();
        assert_eq!(p.name(), Some("Alice"));
        assert_eq!(p.picture_url(), Some("https://example.com/a.jpg"));

        let p = Profile::from_message(&profile_msg(&keys, r#"{"name":"bob"}"#, 1)).unwrap();
        assert_eq!(p.name(), Some("bob"));
    }

    #[test]
    fn unparsable_metadata_yields_none() {
        let keys = Keys::generate();
        assert!(Profile::from_message(&profile_msg(&keys, "not json", 1)).is_none());
    }

    #[test]
    fn newer_profile_supersedes() {
        let keys = Keys::generate();
        let old = Profile::from_message(&profile_msg(&keys, r#"{"name":"old"}"#, 1)).unwrap();
        let new = Profile::from_message(&profile_msg(&keys, r#"{"name":"new"}"#, 2)).unwrap();
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }

    #[test]
    fn tie_breaks_on_lower_id() {
        let keys = Keys::generate();
        let a = Profile::from_message(&profile_msg(&keys, r#"{"name":"a"}"#, 5)).unwrap();
        let b = Profile::from_message(&profile_msg(&keys, r#"{"name":"b"}"#, 5)).unwrap();
        let (low, high) = if a.event_id < b.event_id { (a, b) } else { (b, a) };
        assert!(low.supersedes(&high));
        assert!(!high.supersedes(&low));
    }
}
