//! Session and message-routing layer for the APS model factory.
//!
//! One MQTT session client owns the broker link and fans inbound traffic
//! out into per-topic ring buffers. Around it sit a topic/template
//! registry, command gateways that validate before publishing, a session
//! recorder and a replay engine for recorded timelines.

pub mod config;
pub mod error;
pub mod factory;
pub mod gateway;
pub mod lint;
pub mod mqtt;
pub mod recorder;
pub mod refresh;
pub mod registry;
pub mod replay;

pub use config::{AppConfig, ConnectionDescriptor, Environment};
pub use error::{ApsError, Result, StateError};
pub use mqtt::{ConnectionState, EnvelopeMessage, Payload, Publisher, SessionClient};
