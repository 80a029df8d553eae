use std::time::Duration;
use thiserror::Error;

use super::topic::TopicError;

/// Failures talking to the broker.
///
/// None of these are fatal for the session client: the receive loop keeps
/// reconnecting and publishes simply fail until the link is back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("no CONNACK within {0:?}")]
    ConnectTimeout(Duration),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("connection task closed before handshake completed")]
    Closed,
}
