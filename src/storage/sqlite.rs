//! SQLite storage for nodes, edges and merge history

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::PersistenceAdapter;
use crate::config::Config;
use crate::consolidation::MergeRecord;
use crate::error::{Error, Result};
use crate::events::{PersistenceEvent, SequencedEvent, Snapshot};
use crate::graph::{Edge, EdgeKey};
use crate::node::{MemoryNode, NodeId};

const LAST_SEQUENCE: &str = "last_sequence";

/// Keeps the current state as rows, applying each event as an upsert or delete
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at the configured path
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::persistence("open database", e))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::persistence("open database", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| Error::persistence("initialise schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn write_batch(&self, events: &[SequencedEvent]) -> Result<usize> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::persistence("apply events", e))?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::persistence("begin transaction", e))?;

        let applied = apply_events(&tx, events).map_err(|e| Error::persistence("apply events", e))?;
        tx.commit().map_err(|e| Error::persistence("commit events", e))?;
        Ok(applied)
    }

    fn read_snapshot(&self) -> Result<Snapshot> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::persistence("load snapshot", e))?;
        read_snapshot(&conn).map_err(|e| Error::persistence("load snapshot", e))
    }

    /// Highest event sequence stored so far
    pub fn stored_sequence(&self) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::persistence("read sequence", e))?;
        last_sequence(&conn).map_err(|e| Error::persistence("read sequence", e))
    }
}

#[async_trait]
impl PersistenceAdapter for SqliteStore {
    async fn apply(&self, events: &[SequencedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let applied = self.write_batch(events)?;
        debug!(received = events.len(), applied, "Applied events to SQLite");
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot> {
        self.read_snapshot()
    }

    async fn last_sequence(&self) -> Result<u64> {
        self.stored_sequence()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn last_sequence(conn: &Connection) -> rusqlite::Result<u64> {
    let value: Option<i64> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![LAST_SEQUENCE], |row| row.get(0))
        .optional()?;
    Ok(value.unwrap_or(0).max(0) as u64)
}

fn is_evicted(tx: &Transaction<'_>, id: NodeId) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT 1 FROM evicted WHERE id = ?1",
        params![id.to_string()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn upsert_node(tx: &Transaction<'_>, node: &MemoryNode) -> rusqlite::Result<()> {
    if is_evicted(tx, node.id)? {
        return Ok(());
    }
    tx.execute(
        r#"
        INSERT INTO nodes (id, sequence, status, strength, payload)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            strength = excluded.strength,
            payload = excluded.payload
        "#,
        params![
            node.id.to_string(),
            node.sequence as i64,
            node.status.to_string(),
            node.strength as f64,
            to_json(node)?,
        ],
    )?;
    Ok(())
}

fn upsert_edge(tx: &Transaction<'_>, edge: &Edge) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT INTO edges (source, target, kind, weight, payload)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(source, target, kind) DO UPDATE SET
            weight = excluded.weight,
            payload = excluded.payload
        "#,
        params![
            edge.source.to_string(),
            edge.target.to_string(),
            edge.kind.to_string(),
            edge.weight as f64,
            to_json(edge)?,
        ],
    )?;
    Ok(())
}

fn delete_edge(tx: &Transaction<'_>, key: &EdgeKey) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM edges WHERE source = ?1 AND target = ?2 AND kind = ?3",
        params![key.source.to_string(), key.target.to_string(), key.kind.to_string()],
    )?;
    Ok(())
}

fn record_merge(tx: &Transaction<'_>, record: &MergeRecord) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT INTO merges (merged, survivor, payload) VALUES (?1, ?2, ?3)
        ON CONFLICT(merged) DO UPDATE SET survivor = excluded.survivor, payload = excluded.payload
        "#,
        params![record.merged.to_string(), record.survivor.to_string(), to_json(record)?],
    )?;
    Ok(())
}

fn evict(tx: &Transaction<'_>, id: NodeId, evicted_at: &DateTime<Utc>) -> rusqlite::Result<()> {
    let id = id.to_string();
    tx.execute("DELETE FROM edges WHERE source = ?1 OR target = ?1", params![id])?;
    tx.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
    tx.execute(
        "INSERT OR IGNORE INTO evicted (id, evicted_at) VALUES (?1, ?2)",
        params![id, evicted_at.to_rfc3339()],
    )?;
    Ok(())
}

/// Apply every event newer than the stored sequence. Returns how many were applied.
fn apply_events(tx: &Transaction<'_>, events: &[SequencedEvent]) -> rusqlite::Result<usize> {
    let mut last = last_sequence(tx)?;
    let mut applied = 0;

    for event in events {
        if event.sequence <= last {
            continue;
        }
        match &event.event {
            PersistenceEvent::NodeCreated(node) | PersistenceEvent::NodeUpdated(node) => upsert_node(tx, node)?,
            PersistenceEvent::EdgeUpdated(edge) => upsert_edge(tx, edge)?,
            PersistenceEvent::EdgeRemoved(key) => delete_edge(tx, key)?,
            PersistenceEvent::NodeMerged(record) => record_merge(tx, record)?,
            PersistenceEvent::NodeEvicted { id, evicted_at } => evict(tx, *id, evicted_at)?,
        }
        last = event.sequence;
        applied += 1;
    }

    tx.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![LAST_SEQUENCE, last as i64],
    )?;
    Ok(applied)
}

fn read_snapshot(conn: &Connection) -> rusqlite::Result<Snapshot> {
    let mut stmt = conn.prepare("SELECT payload FROM nodes ORDER BY sequence")?;
    let nodes = stmt
        .query_map([], |row| {
            let payload: String = row.get(0)?;
            from_json::<MemoryNode>(0, &payload)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT payload FROM edges ORDER BY source, target, kind")?;
    let edges = stmt
        .query_map([], |row| {
            let payload: String = row.get(0)?;
            from_json::<Edge>(0, &payload)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT payload FROM merges ORDER BY rowid")?;
    let merges = stmt
        .query_map([], |row| {
            let payload: String = row.get(0)?;
            from_json::<MergeRecord>(0, &payload)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT id, evicted_at FROM evicted ORDER BY rowid")?;
    let evicted = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let evicted_at: String = row.get(1)?;
            let id = NodeId::parse(&id)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
            let evicted_at = DateTime::parse_from_rfc3339(&evicted_at)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
                .with_timezone(&Utc);
            Ok((id, evicted_at))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Snapshot {
        nodes,
        edges,
        merges,
        evicted,
        last_sequence: last_sequence(conn)?,
    })
}
