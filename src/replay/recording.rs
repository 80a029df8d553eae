//! Loading recorded sessions from SQLite or JSON lines.
//!
//! Timestamps come in several shapes (epoch seconds, epoch milliseconds, ISO
//! strings). They are normalized to epoch seconds in memory; the file on
//! disk is never touched.

use chrono::{DateTime, NaiveDateTime, Utc};
use rumqttc::QoS;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ReplayError;
use crate::config::qos_from_u8;
use crate::mqtt::Direction;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingFormat {
    Sqlite,
    JsonLines,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    pub topic: String,
    pub payload: String,
    /// Epoch seconds.
    pub ts: f64,
    pub qos: QoS,
    pub retain: bool,
}

/// A loaded session, sorted by time.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub source: PathBuf,
    pub messages: Vec<RecordedMessage>,
    pub warnings: Vec<String>,
    pub skipped_outbound: usize,
}

impl Recording {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Seconds between the first and last message.
    pub fn duration(&self) -> f64 {
        match (self.messages.first(), self.messages.last()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0.0,
        }
    }

    pub fn from_messages(messages: Vec<RecordedMessage>) -> Self {
        let mut recording = Self {
            messages,
            ..Self::default()
        };
        recording.sort_by_time();
        recording
    }

    fn warn(&mut self, message: String) {
        warn!("{}: {}", self.source.display(), message);
        self.warnings.push(message);
    }

    /// Stable re-sort when the source is out of order.
    fn sort_by_time(&mut self) {
        let ordered = self.messages.windows(2).all(|w| w[0].ts <= w[1].ts);
        if !ordered {
            self.messages.sort_by(|a, b| a.ts.total_cmp(&b.ts));
            self.warn("records were out of order and have been sorted by timestamp".to_string());
        }
    }
}

/// Sniffs the SQLite header, anything else is treated as JSON lines.
pub fn detect_format(path: &Path) -> Result<RecordingFormat, ReplayError> {
    let mut file = File::open(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut header = [0u8; 16];
    let mut read = 0;
    while read < header.len() {
        match file.read(&mut header[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(source) => {
                return Err(ReplayError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    if read == header.len() && &header == SQLITE_MAGIC {
        Ok(RecordingFormat::Sqlite)
    } else {
        Ok(RecordingFormat::JsonLines)
    }
}

/// Reads a recording. Bad records are skipped with a warning; only inbound
/// traffic is kept for replay.
pub fn load_recording(path: &Path) -> Result<Recording, ReplayError> {
    let format = detect_format(path)?;
    debug!("Loading {} as {:?}", path.display(), format);

    let mut recording = Recording {
        source: path.to_path_buf(),
        ..Recording::default()
    };
    match format {
        RecordingFormat::Sqlite => load_sqlite(path, &mut recording)?,
        RecordingFormat::JsonLines => load_json_lines(path, &mut recording)?,
    }
    recording.sort_by_time();

    info!(
        "Loaded {} messages from {} ({} warnings, {} outbound skipped)",
        recording.len(),
        path.display(),
        recording.warnings.len(),
        recording.skipped_outbound
    );
    Ok(recording)
}

fn load_sqlite(path: &Path, recording: &mut Recording) -> Result<(), ReplayError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let columns: HashSet<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(messages)")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<Result<_, _>>()?
    };
    if columns.is_empty() {
        return Err(ReplayError::Format {
            path: path.to_path_buf(),
            message: "no 'messages' table".to_string(),
        });
    }
    for required in ["topic", "payload", "ts"] {
        if !columns.contains(required) {
            return Err(ReplayError::Format {
                path: path.to_path_buf(),
                message: format!("'messages' table has no '{}' column", required),
            });
        }
    }

    let optional = |name: &str, fallback: &str| {
        if columns.contains(name) {
            name.to_string()
        } else {
            fallback.to_string()
        }
    };
    let sql = format!(
        "SELECT topic, payload, ts, {}, {}, {} FROM messages ORDER BY {}",
        optional("qos", "0"),
        optional("retain", "0"),
        optional("direction", "'in'"),
        optional("id", "rowid"),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut index = 0usize;
    while let Some(row) = rows.next()? {
        index += 1;
        let direction = text_of(row.get_ref(5)?).unwrap_or_else(|| "in".to_string());
        if Direction::parse(&direction) == Some(Direction::Out) {
            recording.skipped_outbound += 1;
            continue;
        }

        let Some(topic) = text_of(row.get_ref(0)?).filter(|t| !t.is_empty()) else {
            recording.warn(format!("row {}: missing topic, skipped", index));
            continue;
        };
        let Some(ts) = timestamp_of_sql(row.get_ref(2)?) else {
            recording.warn(format!("row {}: unreadable timestamp, skipped", index));
            continue;
        };
        let payload = text_of(row.get_ref(1)?).unwrap_or_default();
        let qos = match row.get_ref(3)? {
            ValueRef::Integer(q) => u8::try_from(q).ok().and_then(qos_from_u8),
            _ => None,
        };
        let Some(qos) = qos else {
            recording.warn(format!("row {}: invalid qos, skipped", index));
            continue;
        };
        let retain = matches!(row.get_ref(4)?, ValueRef::Integer(r) if r != 0);

        recording.messages.push(RecordedMessage {
            topic,
            payload,
            ts,
            qos,
            retain,
        });
    }
    Ok(())
}

fn load_json_lines(path: &Path, recording: &mut Recording) -> Result<(), ReplayError> {
    let file = File::open(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // Split on raw bytes so one line of invalid UTF-8 costs that line only.
    for (i, bytes) in BufReader::new(file).split(b'\n').enumerate() {
        let line_no = i + 1;
        let bytes = bytes.map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(_) => {
                recording.warn(format!("line {}: invalid UTF-8, skipped", line_no));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_json_record(&line) {
            Ok(Some(message)) => recording.messages.push(message),
            Ok(None) => recording.skipped_outbound += 1,
            Err(reason) => recording.warn(format!("line {}: {}, skipped", line_no, reason)),
        }
    }
    Ok(())
}

/// `Ok(None)` for outbound records.
fn parse_json_record(line: &str) -> Result<Option<RecordedMessage>, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON ({})", e))?;
    let obj = value.as_object().ok_or("not a JSON object")?;

    if let Some(direction) = obj.get("direction").and_then(Value::as_str) {
        if Direction::parse(direction) == Some(Direction::Out) {
            return Ok(None);
        }
    }

    let topic = obj
        .get("topic")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or("missing topic")?;

    let ts = obj
        .get("ts")
        .and_then(timestamp_of_json)
        .or_else(|| obj.get("timestamp").and_then(timestamp_of_json))
        .ok_or("missing or unreadable timestamp")?;

    let payload = match obj.get("payload") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let qos = match obj.get("qos") {
        None => Some(QoS::AtMostOnce),
        Some(q) => q.as_u64().and_then(|q| u8::try_from(q).ok()).and_then(qos_from_u8),
    }
    .ok_or("invalid qos")?;

    let retain = match obj.get("retain") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    };

    Ok(Some(RecordedMessage {
        topic: topic.to_string(),
        payload,
        ts,
        qos,
        retain,
    }))
}

fn text_of(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null => None,
    }
}

fn timestamp_of_sql(value: ValueRef<'_>) -> Option<f64> {
    match value {
        ValueRef::Real(f) => normalize_epoch(f),
        ValueRef::Integer(i) => normalize_epoch(i as f64),
        ValueRef::Text(bytes) => parse_timestamp_str(&String::from_utf8_lossy(bytes)),
        _ => None,
    }
}

fn timestamp_of_json(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(normalize_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn normalize_epoch(value: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(if value > MILLIS_THRESHOLD {
        value / 1000.0
    } else {
        value
    })
}

/// Accepts numeric strings, RFC 3339 and naive ISO date-times (taken as UTC).
pub fn parse_timestamp_str(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<f64>() {
        return normalize_epoch(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(epoch_seconds(dt.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| epoch_seconds(naive.and_utc()))
}

fn epoch_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}
