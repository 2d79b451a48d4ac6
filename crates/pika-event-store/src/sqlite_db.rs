use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use nostr::{Event, EventId, JsonUtil, PublicKey};
use rusqlite::{params, Connection, OptionalExtension};

use crate::storage::{
    BlockList, FilterStore, MessageStore, RelayRecordStore, RemovalReason, TombstoneStore,
};

const EVENT_STORE_DB_FILE: &str = "event_store.sqlite3";

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        kind INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        event_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_kind ON messages(kind);
    CREATE INDEX IF NOT EXISTS idx_messages_pubkey ON messages(pubkey);
    CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);

    CREATE TABLE IF NOT EXISTS tombstones (
        id TEXT PRIMARY KEY,
        reason TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS relay_records (
        id TEXT NOT NULL,
        url TEXT NOT NULL,
        PRIMARY KEY (id, url)
    );

    CREATE TABLE IF NOT EXISTS relay_filters (
        url TEXT PRIMARY KEY,
        filter BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS blocked (
        pubkey TEXT PRIMARY KEY
    );
";

/// SQLite-backed implementation of every persistence collaborator.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let path = data_dir.join(EVENT_STORE_DB_FILE);
        let conn = Connection::open(&path)
            .with_context(|| format!("open event store db {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("apply event store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

fn parse_event_id(hex: &str) -> Option<EventId> {
    match EventId::from_hex(hex) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(%e, id = hex, "impossible state: stored event id does not parse");
            None
        }
    }
}

impl MessageStore for SqliteDb {
    fn filter(&self, predicate: Option<&dyn Fn(&Event) -> bool>) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, event_json FROM messages ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json) = row?;
            let event = match Event::from_json(json.as_str()) {
                Ok(ev) => ev,
                Err(e) => {
                    // Rows are only written after verification, so this is corruption.
                    tracing::error!(%e, id, "impossible state: stored message does not parse");
                    continue;
                }
            };
            if predicate.map(|p| p(&event)).unwrap_or(true) {
                out.push(event);
            }
        }
        Ok(out)
    }

    fn get(&self, id: &EventId) -> anyhow::Result<Option<Event>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT event_json FROM messages WHERE id = ?1",
                [id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| Event::from_json(j.as_str()).context("decode stored message"))
            .transpose()
    }

    fn put(&self, event: &Event) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO messages (id, pubkey, kind, created_at, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_hex(),
                event.pubkey.to_hex(),
                event.kind.as_u16() as i64,
                event.created_at.as_secs() as i64,
                event.as_json(),
            ],
        )?;
        Ok(())
    }
}

impl TombstoneStore for SqliteDb {
    fn get_mark(&self, id: &EventId) -> anyhow::Result<Option<RemovalReason>> {
        let reason: Option<String> = self
            .conn()
            .query_row(
                "SELECT reason FROM tombstones WHERE id = ?1",
                [id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason.map(|r| RemovalReason::from_json(&r)))
    }

    fn mark_event(&self, id: &EventId, reason: &RemovalReason) -> anyhow::Result<()> {
        // First reason wins; tombstones are never rewritten.
        self.conn().execute(
            "INSERT OR IGNORE INTO tombstones (id, reason) VALUES (?1, ?2)",
            params![id.to_hex(), reason.to_json()],
        )?;
        Ok(())
    }

    fn get_all_marks(&self) -> anyhow::Result<Vec<(EventId, RemovalReason)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, reason FROM tombstones")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, reason) = row?;
            if let Some(id) = parse_event_id(&id) {
                out.push((id, RemovalReason::from_json(&reason)));
            }
        }
        Ok(out)
    }
}

impl RelayRecordStore for SqliteDb {
    fn set_relay_record(&self, id: &EventId, url: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO relay_records (id, url) VALUES (?1, ?2)",
            params![id.to_hex(), url],
        )?;
        Ok(())
    }

    fn get_all_relay_records(&self) -> anyhow::Result<Vec<(EventId, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, url FROM relay_records")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, url) = row?;
            if let Some(id) = parse_event_id(&id) {
                out.push((id, url));
            }
        }
        Ok(out)
    }
}

impl FilterStore for SqliteDb {
    fn save_filter(&self, url: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO relay_filters (url, filter) VALUES (?1, ?2)
             ON CONFLICT(url) DO UPDATE SET filter = excluded.filter",
            params![url, bytes],
        )?;
        Ok(())
    }

    fn load_filters(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT url, filter FROM relay_filters")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl BlockList for SqliteDb {
    fn is_blocked(&self, pubkey: &PublicKey) -> bool {
        self.conn()
            .query_row(
                "SELECT 1 FROM blocked WHERE pubkey = ?1",
                [pubkey.to_hex()],
                |_| Ok(()),
            )
            .optional()
            .map(|hit| hit.is_some())
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "failed to read block list");
                false
            })
    }

    fn block(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blocked (pubkey) VALUES (?1)",
            [pubkey.to_hex()],
        )?;
        Ok(())
    }

    fn unblock(&self, pubkey: &PublicKey) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM blocked WHERE pubkey = ?1", [pubkey.to_hex()])?;
        Ok(())
    }

    fn blocked(&self) -> Vec<PublicKey> {
        let conn = self.conn();
        let mut stmt = match conn.prepare("SELECT pubkey FROM blocked") {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%e, "failed to prepare block list query");
                return vec![];
            }
        };
        let rows = match stmt.query_map([], |row| row.get::<_, String>(0)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%e, "failed to query block list");
                return vec![];
            }
        };
        rows.flatten()
            .filter_map(|hex| PublicKey::from_hex(&hex).ok())
            .collect()
    }
}
