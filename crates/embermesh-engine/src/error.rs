//! Engine error types

use embermesh_core::CoreError;
use embermesh_protocol::ProtocolError;
use thiserror::Error;

use crate::hal::RadioFault;
use crate::storage::StorageError;

/// Result alias using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal engine failures; per-packet faults are logged and counted instead
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wire codec failure on locally built frames
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Crypto or identity failure on locally built material
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Persistent storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Radio collaborator failure that reset could not clear
    #[error("radio fault: {0}")]
    Radio(#[from] RadioFault),
}
