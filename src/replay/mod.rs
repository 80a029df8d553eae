//! # Session Replay
//!
//! Reproduces recorded broker traffic with controllable timing, and
//! summarises recordings for offline analysis.
//!
//! ```text
//! recording (.db / .jsonl) ──► load_recording ──► Recording
//!                                                    │
//!                        ┌───────────────────────────┤
//!                        ▼                           ▼
//!                  ReplayEngine ──► Publisher   SessionStats
//! ```

pub mod engine;
pub mod recording;
pub mod stats;

pub use engine::{ReplayEngine, ReplayState};
pub use recording::{detect_format, load_recording, RecordedMessage, Recording, RecordingFormat};
pub use stats::{SessionStats, TopicStats};

use std::path::PathBuf;
use thiserror::Error;

use crate::error::StateError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unsupported recording {path:?}: {message}")]
    Format { path: PathBuf, message: String },

    #[error(transparent)]
    State(#[from] StateError),
}
