//! Tokenizer for decrypted chat text: links, mentions and quoted messages.

use std::sync::OnceLock;

use nostr::nips::nip19::{FromBech32, Nip19Event, Nip19Profile};
use nostr::{EventId, PublicKey};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Text(&'a str),
    Link(&'a str),
    Mention(PublicKey),
    Quote(EventId),
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s<>"]+|nostr:(?:npub1|nprofile1|note1|nevent1)[0-9a-z]+"#)
            .expect("valid rich text token regex")
    })
}

/// Parsed view over a text body. Iterate with [`RichText::tokens`]; every call
/// starts a fresh pass.
#[derive(Debug, Clone, Copy)]
pub struct RichText<'a> {
    source: &'a str,
}

impl<'a> RichText<'a> {
    pub fn parse(source: &'a str) -> Self {
        Self { source }
    }

    pub fn tokens(&self) -> Tokens<'a> {
        Tokens {
            source: self.source,
            pos: 0,
            pending: None,
        }
    }

    pub fn mentions(&self) -> impl Iterator<Item = PublicKey> + 'a {
        self.tokens().filter_map(|t| match t {
            Token::Mention(pk) => Some(pk),
            _ => None,
        })
    }
}

/// Lazy token stream. Adjacent plain text is always yielded as one `Text`.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    source: &'a str,
    pos: usize,
    pending: Option<Token<'a>>,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if let Some(token) = self.pending.take() {
            return Some(token);
        }
        if self.pos >= self.source.len() {
            return None;
        }

        let start = self.pos;
        let mut search = start;
        while let Some(m) = token_regex().find_at(self.source, search) {
            if let Some((token, len)) = classify(m.as_str()) {
                let (tok_start, tok_end) = (m.start(), m.start() + len);
                self.pos = tok_end;
                if tok_start > start {
                    self.pending = Some(token);
                    return Some(Token::Text(&self.source[start..tok_start]));
                }
                return Some(token);
            }
            search = m.end();
        }

        self.pos = self.source.len();
        Some(Token::Text(&self.source[start..]))
    }
}

/// Token for a regex hit plus how many bytes of the hit it covers.
fn classify(hit: &str) -> Option<(Token<'_>, usize)> {
    if let Some(entity) = hit.strip_prefix("nostr:") {
        let token = if entity.starts_with("npub1") {
            Token::Mention(PublicKey::from_bech32(entity).ok()?)
        } else if entity.starts_with("nprofile1") {
            Token::Mention(Nip19Profile::from_bech32(entity).ok()?.public_key)
        } else if entity.starts_with("note1") {
            Token::Quote(EventId::from_bech32(entity).ok()?)
        } else {
            Token::Quote(Nip19Event::from_bech32(entity).ok()?.event_id)
        };
        return Some((token, hit.len()));
    }

    let link = hit.trim_end_matches(['.', ',', ';', ':', '!', '?', '\'', '"', ')', ']']);
    let scheme_len = if link.starts_with("https://") { 8 } else { 7 };
    if link.len() <= scheme_len {
        return None;
    }
    Some((Token::Link(link), link.len()))
}
