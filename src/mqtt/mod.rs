//! # MQTT Session Layer
//!
//! Everything that touches the broker lives here. The rest of the crate sees
//! three things: the [`SessionClient`] that owns the one network link, the
//! [`Publisher`] trait that gateways and replay publish through, and the
//! immutable [`EnvelopeMessage`] that flows through buffers and recordings.
//!
//! ```text
//! mqtt/
//! ├── topic.rs      - filter parsing, wildcard matching, specificity order
//! ├── message.rs    - envelope, payload views, direction
//! ├── buffer.rs     - bounded per-pattern history, fan-out dispatch
//! ├── publisher.rs  - publish seam used by gateways and replay
//! ├── session.rs    - single-owner client, receive loop, reconnects
//! └── error.rs      - transport failures
//! ```
//!
//! ## Data flow
//!
//! ```text
//! broker ──► receive loop ──► BufferSet::dispatch ──► TopicBuffer (per pattern)
//!                  │
//!                  └────────► SessionRecorder (optional)
//!
//! UI / gateways ──► SessionClient::publish ──► broker
//! ```
//!
//! A message is stored once as `Arc<EnvelopeMessage>` and shared by every
//! buffer whose pattern matches its topic.

pub mod buffer;
pub mod error;
pub mod message;
pub mod publisher;
pub mod session;
pub mod topic;

pub use buffer::{BufferSet, TopicBuffer, DEFAULT_BUFFER_SIZE};
pub use error::TransportError;
pub use message::{Direction, EnvelopeMessage, Payload};
pub use publisher::{PublishFuture, PublishId, Publisher};
pub use session::{ConnectionState, SessionClient, SessionStatus, STATUS_TOPIC};
pub use topic::{topic_matches, TopicError, TopicPattern};
