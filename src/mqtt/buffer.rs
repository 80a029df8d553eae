//! Bounded per-pattern history with drop-oldest eviction.
//!
//! Each buffer carries its own lock so the receive loop only ever contends
//! with readers of the one buffer it is appending to. Reads copy out a
//! snapshot of `Arc`s and release the lock immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

use super::message::EnvelopeMessage;
use super::topic::{TopicError, TopicPattern};

pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug)]
pub struct TopicBuffer {
    pattern: TopicPattern,
    max_size: usize,
    entries: Mutex<VecDeque<Arc<EnvelopeMessage>>>,
}

impl TopicBuffer {
    pub fn new(pattern: TopicPattern, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            pattern,
            max_size,
            entries: Mutex::new(VecDeque::with_capacity(max_size.min(64))),
        }
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Appends, evicting the oldest entry when full. Returns true on eviction.
    ///
    /// `ts` is clamped so it never runs backwards inside one buffer.
    pub fn push(&self, message: Arc<EnvelopeMessage>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let message = match entries.back() {
            Some(last) if last.ts > message.ts => {
                let mut adjusted = (*message).clone();
                adjusted.ts = last.ts;
                Arc::new(adjusted)
            }
            _ => message,
        };

        let evicted = if entries.len() >= self.max_size {
            entries.pop_front();
            true
        } else {
            false
        };
        entries.push_back(message);
        evicted
    }

    pub fn snapshot(&self) -> Vec<Arc<EnvelopeMessage>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<EnvelopeMessage>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// All buffers of one session client, keyed by the raw pattern string.
#[derive(Debug)]
pub struct BufferSet {
    max_size: usize,
    buffers: RwLock<HashMap<String, Arc<TopicBuffer>>>,
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl BufferSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the buffer for `pattern`, creating it on first use.
    pub fn ensure(&self, pattern: &str) -> Result<Arc<TopicBuffer>, TopicError> {
        if let Some(existing) = self.get(pattern) {
            return Ok(existing);
        }

        let parsed = TopicPattern::parse(pattern)?;
        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers
            .entry(pattern.to_string())
            .or_insert_with(|| {
                debug!("Creating buffer for pattern {}", pattern);
                Arc::new(TopicBuffer::new(parsed, self.max_size))
            })
            .clone();
        Ok(buffer)
    }

    pub fn get(&self, pattern: &str) -> Option<Arc<TopicBuffer>> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
            .cloned()
    }

    /// Appends the message to every buffer whose pattern matches its topic.
    ///
    /// Returns the number of buffers that received it.
    pub fn dispatch(&self, message: &Arc<EnvelopeMessage>) -> usize {
        let targets: Vec<Arc<TopicBuffer>> = {
            let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);
            buffers
                .values()
                .filter(|b| b.pattern.matches(&message.topic))
                .cloned()
                .collect()
        };

        for buffer in &targets {
            buffer.push(Arc::clone(message));
        }
        targets.len()
    }

    pub fn snapshot(&self, pattern: &str) -> Result<Vec<Arc<EnvelopeMessage>>, TopicError> {
        Ok(self.ensure(pattern)?.snapshot())
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }

    pub fn clear_all(&self) {
        let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);
        for buffer in buffers.values() {
            buffer.clear();
        }
    }

    pub fn total_len(&self) -> usize {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message::Payload;
    use rumqttc::QoS;

    fn msg(topic: &str, body: &str) -> Arc<EnvelopeMessage> {
        Arc::new(EnvelopeMessage::inbound(
            topic,
            Payload::from_text(body),
            QoS::AtLeastOnce,
            false,
        ))
    }

    #[test]
    fn buffer_keeps_last_n_in_order() {
        let set = BufferSet::new(5);
        set.ensure("a/+").unwrap();
        for i in 0..12 {
            set.dispatch(&msg("a/b", &i.to_string()));
        }
        let snap = set.snapshot("a/+").unwrap();
        assert_eq!(snap.len(), 5);
        let bodies: Vec<&str> = snap.iter().map(|m| m.payload.text()).collect();
        assert_eq!(bodies, vec!["7", "8", "9", "10", "11"]);
    }

    #[test]
    fn overlapping_patterns_each_receive_the_message() {
        let set = BufferSet::default();
        set.ensure("module/v1/ff/+/state").unwrap();
        set.ensure("module/v1/ff/SVR3QA0022/state").unwrap();
        set.ensure("fts/#").unwrap();

        let delivered = set.dispatch(&msg("module/v1/ff/SVR3QA0022/state", "{}"));
        assert_eq!(delivered, 2);
        assert_eq!(set.snapshot("module/v1/ff/+/state").unwrap().len(), 1);
        assert_eq!(set.snapshot("module/v1/ff/SVR3QA0022/state").unwrap().len(), 1);
        assert!(set.snapshot("fts/#").unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_not_consuming() {
        let set = BufferSet::default();
        set.ensure("x").unwrap();
        set.dispatch(&msg("x", "1"));
        assert_eq!(set.snapshot("x").unwrap().len(), 1);
        assert_eq!(set.snapshot("x").unwrap().len(), 1);
    }

    #[test]
    fn reading_unknown_pattern_creates_empty_buffer() {
        let set = BufferSet::default();
        assert!(set.snapshot("ccu/state").unwrap().is_empty());
        assert_eq!(set.patterns(), vec!["ccu/state".to_string()]);
        assert!(set.snapshot("bad/#/x").is_err());
    }

    #[test]
    fn timestamps_never_run_backwards() {
        let buffer = TopicBuffer::new(TopicPattern::parse("t").unwrap(), 10);
        let mut late = EnvelopeMessage::inbound("t", Payload::from_text("a"), QoS::AtMostOnce, false);
        late.ts = 10.0;
        let mut early = late.clone();
        early.ts = 5.0;
        buffer.push(Arc::new(late));
        buffer.push(Arc::new(early));
        let snap = buffer.snapshot();
        assert!(snap[1].ts >= snap[0].ts);
    }

    #[test]
    fn clear_all_keeps_patterns() {
        let set = BufferSet::default();
        set.ensure("x").unwrap();
        set.dispatch(&msg("x", "1"));
        set.clear_all();
        assert_eq!(set.total_len(), 0);
        assert_eq!(set.patterns().len(), 1);
    }
}
