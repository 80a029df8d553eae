//! Durable targets for recorded messages.
//!
//! Both stores write the same fields so the replay loader can read either.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::StorageError;
use crate::mqtt::message::EnvelopeMessage;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL NOT NULL,
  direction TEXT NOT NULL,
  topic TEXT NOT NULL,
  payload TEXT NOT NULL,
  qos INTEGER NOT NULL,
  retain INTEGER NOT NULL,
  mid INTEGER
);
CREATE INDEX IF NOT EXISTS idx_ts ON messages(ts);
CREATE INDEX IF NOT EXISTS idx_topic ON messages(topic);
";

pub trait RecordStore: Send {
    fn append(&mut self, batch: &[Arc<EnvelopeMessage>]) -> Result<usize, StorageError>;
    fn flush(&mut self) -> Result<(), StorageError>;
    fn path(&self) -> &Path;
}

/// Picks the store by extension: `.jsonl`/`.ndjson` write JSON lines,
/// everything else SQLite.
pub fn open_store(
    path: &Path,
    max_rows: Option<u64>,
    prune_every: u64,
) -> Result<Box<dyn RecordStore>, StorageError> {
    if is_json_lines(path) {
        Ok(Box::new(JsonLinesStore::open(path)?))
    } else {
        Ok(Box::new(SqliteStore::open(path, max_rows, prune_every)?))
    }
}

pub fn is_json_lines(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
        Some(ref ext) if ext == "jsonl" || ext == "ndjson"
    )
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Connection,
    max_rows: Option<u64>,
    prune_every: u64,
    since_prune: u64,
}

impl SqliteStore {
    pub fn open(path: &Path, max_rows: Option<u64>, prune_every: u64) -> Result<Self, StorageError> {
        ensure_parent(path)?;
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode {}", mode);
        conn.execute_batch(SCHEMA)?;
        info!("Recording to SQLite store {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            max_rows,
            prune_every: prune_every.max(1),
            since_prune: 0,
        })
    }

    fn prune(&mut self) -> Result<(), StorageError> {
        let Some(max_rows) = self.max_rows else {
            return Ok(());
        };
        let removed = self.conn.execute(
            "DELETE FROM messages WHERE id <= (SELECT MAX(id) FROM messages) - ?1",
            params![max_rows as i64],
        )?;
        if removed > 0 {
            debug!("Pruned {} rows from {}", removed, self.path.display());
        }
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn append(&mut self, batch: &[Arc<EnvelopeMessage>]) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO messages(ts, direction, topic, payload, qos, retain, mid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for msg in batch {
                stmt.execute(params![
                    msg.epoch_seconds(),
                    msg.direction.as_str(),
                    msg.topic,
                    msg.payload.text(),
                    msg.qos_u8() as i64,
                    msg.retain as i64,
                    msg.mid.map(|m| m as i64),
                ])?;
            }
        }
        tx.commit()?;

        self.since_prune += batch.len() as u64;
        if self.since_prune >= self.prune_every {
            self.since_prune = 0;
            self.prune()?;
        }
        Ok(batch.len())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.prune()?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    ts: f64,
    timestamp: String,
    direction: &'a str,
    topic: &'a str,
    payload: &'a str,
    qos: u8,
    retain: bool,
    mid: Option<u64>,
}

pub struct JsonLinesStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        ensure_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Recording to JSON lines store {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl RecordStore for JsonLinesStore {
    fn append(&mut self, batch: &[Arc<EnvelopeMessage>]) -> Result<usize, StorageError> {
        for msg in batch {
            let line = JsonLine {
                ts: msg.epoch_seconds(),
                timestamp: msg.iso_timestamp(),
                direction: msg.direction.as_str(),
                topic: &msg.topic,
                payload: msg.payload.text(),
                qos: msg.qos_u8(),
                retain: msg.retain,
                mid: msg.mid,
            };
            serde_json::to_writer(&mut self.writer, &line)
                .map_err(|e| StorageError::Serialize(e.to_string()))?;
            self.writer.write_all(b"\n").map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(batch.len())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.writer.flush().map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
