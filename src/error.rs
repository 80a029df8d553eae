//! Crate-wide error types.
//!
//! Each area owns its own error enum next to its code. [`ApsError`] gathers
//! them for callers that want a single type, and [`StateError`] covers calls
//! made at the wrong point of a lifecycle.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::mqtt::TransportError;
use crate::recorder::StorageError;
use crate::registry::{RegistryError, ValidationError};
use crate::replay::ReplayError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("no recording loaded")]
    NotLoaded,

    #[error("the loaded recording is empty")]
    EmptySession,

    #[error("replay speed must be a positive number, got {0}")]
    InvalidSpeed(f64),

    #[error("{operation} is not allowed while {state}")]
    WrongState {
        operation: &'static str,
        state: String,
    },

    #[error("order {0} has been aborted")]
    OrderAborted(String),
}

#[derive(Debug, Error)]
pub enum ApsError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T, E = ApsError> = std::result::Result<T, E>;
