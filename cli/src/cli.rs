use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "pika-store", version, about = "Inspect and replay a local Nostr event store")]
pub struct Cli {
    #[arg(long, env = "PIKA_STORE_DATA_DIR", default_value = ".pika-store")]
    pub data_dir: PathBuf,

    /// Local identity (nsec or hex). Needed to decrypt direct messages.
    #[arg(long, env = "PIKA_STORE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// Print machine-readable JSON.
    #[arg(long, default_value_t = false, global = true)]
    pub json: bool,

    #[arg(long, short, default_value_t = false, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Print the local public key.
    Whoami,
    /// Replay an NDJSON message log into the store ("-" reads stdin).
    Ingest {
        file: PathBuf,
        /// Relay URL for lines that do not carry their own.
        #[arg(long)]
        relay: Option<String>,
    },
    /// List conversation summaries, most recent first.
    Conversations {
        #[arg(long, value_enum, default_value_t = ConversationFilter::All)]
        filter: ConversationFilter,
    },
    /// Decrypted history with one counterparty.
    Messages { pubkey: String },
    /// Latest profile for a public key.
    Profile { pubkey: String },
    /// Relays that delivered a message.
    Relays { id: String },
    /// Tombstone a message locally.
    Remove { id: String },
    Block { pubkey: String },
    Unblock { pubkey: String },
    /// Compose an encrypted direct message, store it, and print it for publishing.
    Send {
        to: String,
        text: String,
        /// Mark the payload as an image reference.
        #[arg(long, default_value_t = false)]
        image: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConversationFilter {
    All,
    Contacts,
    Strangers,
    Blocked,
}
