use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use crate::config::qos_to_u8;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since the first call in this process.
pub fn monotonic_seconds() -> f64 {
    PROCESS_EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Which side of the client a message passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body as received or sent.
///
/// Raw bytes stay reachable for the rare binary topic, `text` is the UTF-8
/// decode with replacement characters and `json` is parsed on first access.
#[derive(Clone)]
pub struct Payload {
    raw: Bytes,
    text: String,
    lossy: bool,
    json: OnceLock<Option<Value>>,
}

impl Payload {
    pub fn from_bytes(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let (text, lossy) = match std::str::from_utf8(&raw) {
            Ok(s) => (s.to_string(), false),
            Err(_) => (String::from_utf8_lossy(&raw).into_owned(), true),
        };
        Self {
            raw,
            text,
            lossy,
            json: OnceLock::new(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            raw: Bytes::from(text.clone().into_bytes()),
            text,
            lossy: false,
            json: OnceLock::new(),
        }
    }

    /// Serializes a structured value as compact UTF-8 JSON without ASCII escaping.
    pub fn from_json(value: &Value) -> Self {
        let payload = Self::from_text(value.to_string());
        let _ = payload.json.set(Some(value.clone()));
        payload
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Decoded JSON, `None` when the text is not valid JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_str(&self.text).ok())
            .as_ref()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.raw.len())
            .field("lossy", &self.lossy)
            .field("text", &preview(&self.text, 64))
            .finish()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::from_text(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::from_text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::from_bytes(value)
    }
}

impl From<&Value> for Payload {
    fn from(value: &Value) -> Self {
        Payload::from_json(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from_json(&value)
    }
}

/// Unit carried by topic buffers, the recorder and the replay engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvelopeMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: QoS,
    pub retain: bool,
    /// Monotonic seconds, see [`monotonic_seconds`]
    pub ts: f64,
    pub received_at: DateTime<Utc>,
    pub direction: Direction,
    pub mid: Option<u64>,
}

impl EnvelopeMessage {
    pub fn inbound(topic: impl Into<String>, payload: Payload, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            ts: monotonic_seconds(),
            received_at: Utc::now(),
            direction: Direction::In,
            mid: None,
        }
    }

    pub fn outbound(
        topic: impl Into<String>,
        payload: Payload,
        qos: QoS,
        retain: bool,
        mid: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            ts: monotonic_seconds(),
            received_at: Utc::now(),
            direction: Direction::Out,
            mid: Some(mid),
        }
    }

    pub fn qos_u8(&self) -> u8 {
        qos_to_u8(self.qos)
    }

    /// Wall clock as epoch seconds.
    pub fn epoch_seconds(&self) -> f64 {
        self.received_at.timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn iso_timestamp(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for EnvelopeMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.direction,
            self.topic,
            preview(self.payload.text(), 60)
        )
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}
