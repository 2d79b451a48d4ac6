mod cli;
mod replay;

use std::io::Read;

use anyhow::Context;
use clap::Parser;
use nostr::nips::nip19::ToBech32;
use nostr::{EventId, JsonUtil, Keys, PublicKey};
use pika_event_store::logging::init_logging;
use pika_event_store::{
    build_direct_message, Admitted, ChatContent, ChatCore, ConversationSummary, Delivery,
};
use serde_json::{json, Value};

use cli::{Cli, Cmd, ConversationFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(if args.verbose {
        "pika_event_store=debug,pika_store=debug"
    } else {
        "warn"
    });

    let keys = Keys::parse(&args.secret_key).context("parse secret key")?;
    let core = ChatCore::open(&args.data_dir, keys.clone())
        .with_context(|| format!("open store in {}", args.data_dir.display()))?;
    core.ready().await;

    let out = match args.cmd {
        Cmd::Whoami => json!({
            "pubkey": keys.public_key().to_hex(),
            "npub": keys.public_key().to_bech32()?,
        }),
        Cmd::Ingest { file, relay } => {
            let text = if file.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("read {}", file.display()))?
            };
            ingest(&core, &text, relay.as_deref()).await
        }
        Cmd::Conversations { filter } => {
            let summaries: Vec<ConversationSummary> = match filter {
                ConversationFilter::All => core.get_conversation_list(),
                ConversationFilter::Contacts => core.get_contacts().collect(),
                ConversationFilter::Strangers => core.get_strangers().collect(),
                ConversationFilter::Blocked => core.get_blocked().collect(),
            };
            Value::Array(summaries.iter().map(|s| summary_json(&core, s)).collect())
        }
        Cmd::Messages { pubkey } => {
            let pubkey = parse_pubkey(&pubkey)?;
            let messages = core.messages_with(&pubkey);
            Value::Array(
                messages
                    .iter()
                    .map(|m| {
                        let (kind, content) = match &m.content {
                            ChatContent::Text(t) => ("text", t.as_str()),
                            ChatContent::Image(url) => ("image", url.as_str()),
                        };
                        json!({
                            "id": m.id.to_hex(),
                            "outgoing": m.outgoing,
                            "created_at": m.created_at.as_secs(),
                            "lamport": m.lamport,
                            "kind": kind,
                            "content": content,
                        })
                    })
                    .collect(),
            )
        }
        Cmd::Profile { pubkey } => {
            let pubkey = parse_pubkey(&pubkey)?;
            match core.get_profile_by_public_key(&pubkey) {
                Some(p) => json!({
                    "pubkey": p.pubkey.to_hex(),
                    "event_id": p.event_id.to_hex(),
                    "created_at": p.created_at.as_secs(),
                    "name": p.name(),
                    "picture": p.picture_url(),
                }),
                None => Value::Null,
            }
        }
        Cmd::Relays { id } => {
            let id = parse_id(&id)?;
            json!(core.relay_records(&id))
        }
        Cmd::Remove { id } => {
            let id = parse_id(&id)?;
            core.remove(&id);
            json!({ "removed": id.to_hex() })
        }
        Cmd::Block { pubkey } => {
            let pubkey = parse_pubkey(&pubkey)?;
            core.block(&pubkey)?;
            json!({ "blocked": pubkey.to_hex() })
        }
        Cmd::Unblock { pubkey } => {
            let pubkey = parse_pubkey(&pubkey)?;
            core.unblock(&pubkey)?;
            json!({ "unblocked": pubkey.to_hex() })
        }
        Cmd::Send { to, text, image } => {
            let to = parse_pubkey(&to)?;
            let event = build_direct_message(&keys, &to, &text, image, core.store().lamport())?;
            match core.admit(event.clone(), None).await {
                Ok(Admitted::New(_)) => {}
                Ok(Admitted::Duplicate { .. }) => {
                    tracing::warn!(id = %event.id, "composed message already stored")
                }
                Err(e) => return Err(e.into()),
            }
            serde_json::from_str(&event.as_json())?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

async fn ingest(core: &ChatCore, text: &str, default_relay: Option<&str>) -> Value {
    let (tx, rx) = flume::bounded::<Delivery>(1024);
    let producer = async move {
        let mut skipped = 0usize;
        for (n, line) in text.lines().enumerate() {
            match replay::parse_line(line, default_relay) {
                Ok(Some(delivery)) => {
                    if tx.send_async(delivery).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(line = n + 1, %e, "skipping unreadable line");
                    skipped += 1;
                }
            }
        }
        skipped
    };
    let (skipped, stats) = tokio::join!(producer, core.ingest(rx));
    json!({
        "new": stats.new,
        "duplicates": stats.duplicates,
        "removed": stats.removed,
        "rejected": stats.rejected,
        "unreadable_lines": skipped,
    })
}

fn summary_json(core: &ChatCore, s: &ConversationSummary) -> Value {
    let name = core
        .get_profile_by_public_key(&s.pubkey)
        .and_then(|p| p.name().map(str::to_string));
    json!({
        "pubkey": s.pubkey.to_hex(),
        "name": name,
        "classification": format!("{:?}", s.classification()).to_lowercase(),
        "unread": s.unread,
        "pinned": s.pinned,
        "relays": s.relays,
        "last_message_at": s.last_message().map(|m| m.created_at().as_secs()),
    })
}

fn parse_pubkey(s: &str) -> anyhow::Result<PublicKey> {
    PublicKey::parse(s).with_context(|| format!("invalid public key: {s}"))
}

fn parse_id(s: &str) -> anyhow::Result<EventId> {
    EventId::parse(s).with_context(|| format!("invalid event id: {s}"))
}
