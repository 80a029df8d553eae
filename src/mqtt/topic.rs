//! MQTT topic filters compiled once and matched on the receive-loop hot path.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("empty topic filter")]
    Empty,
    #[error("'#' must be the last level in '{0}'")]
    HashNotLast(String),
    #[error("wildcard must occupy a whole level in '{0}'")]
    PartialWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Exact(String),
    Plus,
    Hash,
}

impl Level {
    fn rank(&self) -> u8 {
        match self {
            Level::Exact(_) => 0,
            Level::Plus => 1,
            Level::Hash => 2,
        }
    }
}

/// A parsed topic filter, e.g. `module/v1/ff/+/state`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        if filter.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" => {
                    if idx != parts.len() - 1 {
                        return Err(TopicError::HashNotLast(filter.to_string()));
                    }
                    Level::Hash
                }
                "+" => Level::Plus,
                other if other.contains('#') || other.contains('+') => {
                    return Err(TopicError::PartialWildcard(filter.to_string()))
                }
                other => Level::Exact(other.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: filter.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.wildcard_count() > 0
    }

    pub fn wildcard_count(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| !matches!(l, Level::Exact(_)))
            .count()
    }

    /// MQTT matching: `+` is exactly one level, `#` is zero or more trailing levels.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && matches!(self.levels.first(), Some(Level::Plus) | Some(Level::Hash))
        {
            return false;
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Hash => return true,
                Level::Plus => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }

    /// Orders patterns so that the more specific one sorts first.
    ///
    /// Fewer wildcards win, then position by position an exact level beats
    /// `+` which beats `#`.
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        self.wildcard_count()
            .cmp(&other.wildcard_count())
            .then_with(|| {
                for (a, b) in self.levels.iter().zip(other.levels.iter()) {
                    let ord = a.rank().cmp(&b.rank());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
            .then_with(|| other.levels.len().cmp(&self.levels.len()))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Convenience matcher for one-off checks.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    TopicPattern::parse(filter)
        .map(|p| p.matches(topic))
        .unwrap_or(false)
}
