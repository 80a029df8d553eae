use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use super::recording::RecordedMessage;
use crate::registry::TopicRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicStats {
    pub topic: String,
    pub count: usize,
    pub bytes: usize,
    pub friendly_name: Option<String>,
    pub category: Option<String>,
}

/// Offline summary of a recorded session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub message_count: usize,
    pub duration_secs: f64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    /// Busiest topics first.
    pub topics: Vec<TopicStats>,
}

impl SessionStats {
    pub fn from_session(messages: &[RecordedMessage], registry: Option<&TopicRegistry>) -> Self {
        let mut per_topic: HashMap<&str, (usize, usize)> = HashMap::new();
        for message in messages {
            let entry = per_topic.entry(message.topic.as_str()).or_default();
            entry.0 += 1;
            entry.1 += message.payload.len();
        }

        let mut topics: Vec<TopicStats> = per_topic
            .into_iter()
            .map(|(topic, (count, bytes))| {
                let entry = registry.and_then(|r| r.resolve(topic));
                TopicStats {
                    topic: topic.to_string(),
                    count,
                    bytes,
                    friendly_name: entry.as_ref().map(|e| e.friendly_name.clone()),
                    category: entry.as_ref().map(|e| e.category.clone()),
                }
            })
            .collect();
        topics.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.topic.cmp(&b.topic)));

        let first_ts = messages.iter().map(|m| m.ts).reduce(f64::min);
        let last_ts = messages.iter().map(|m| m.ts).reduce(f64::max);

        Self {
            message_count: messages.len(),
            duration_secs: match (first_ts, last_ts) {
                (Some(first), Some(last)) => last - first,
                _ => 0.0,
            },
            first: first_ts.and_then(to_datetime),
            last: last_ts.and_then(to_datetime),
            topics,
        }
    }

    pub fn messages_per_second(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.message_count as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

fn to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((epoch * 1_000_000.0).round() as i64)
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} messages over {:.1}s ({:.1} msg/s)",
            self.message_count,
            self.duration_secs,
            self.messages_per_second()
        )?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            writeln!(f, "from {} to {}", first.to_rfc3339(), last.to_rfc3339())?;
        }
        for topic in &self.topics {
            let label = topic.friendly_name.as_deref().unwrap_or("-");
            writeln!(
                f,
                "{:>7}  {:>9}B  {:<40}  {}",
                topic.count, topic.bytes, topic.topic, label
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    fn msg(topic: &str, ts: f64) -> RecordedMessage {
        RecordedMessage {
            topic: topic.to_string(),
            payload: "{}".to_string(),
            ts,
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn counts_per_topic_and_duration() {
        let registry = TopicRegistry::from_sources([(
            "ccu",
            "category = \"CCU\"\n[[topics]]\npattern = \"ccu/state\"\nfriendly_name = \"CCU state\"\n",
        )]);
        let messages = vec![
            msg("ccu/state", 1_700_000_000.0),
            msg("module/v1/ff/A/state", 1_700_000_001.0),
            msg("ccu/state", 1_700_000_004.0),
        ];
        let stats = SessionStats::from_session(&messages, Some(&registry));

        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.duration_secs, 4.0);
        assert_eq!(stats.topics[0].topic, "ccu/state");
        assert_eq!(stats.topics[0].count, 2);
        assert_eq!(stats.topics[0].friendly_name.as_deref(), Some("CCU state"));
        assert_eq!(stats.topics[1].friendly_name, None);
        assert_eq!(stats.first.unwrap().timestamp(), 1_700_000_000);
        assert!(stats.to_string().contains("3 messages"));
    }

    #[test]
    fn empty_session_has_no_range() {
        let stats = SessionStats::from_session(&[], None);
        assert_eq!(stats.message_count, 0);
        assert!(stats.first.is_none());
        assert_eq!(stats.messages_per_second(), 0.0);
    }
}
