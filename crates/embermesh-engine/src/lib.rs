//! Embermesh Engine - the repeater's event-driven core
//!
//! A single-task engine that turns radio events into forwarding, login,
//! mailbox and alerting behavior. Hardware sits behind the [`hal`] traits,
//! persistence behind [`storage::BlockStorage`]; the engine itself performs
//! no I/O beyond those seams and is fully deterministic given a [`hal::Clock`].
//!
//! # Modules
//!
//! - [`engine`] - the run loop, commands and the control handle
//! - [`hal`] - radio/clock collaborator traits and the event channel
//! - [`forward`] - relay decisions, CSMA timing, adaptive TX power
//! - [`dedup`] - recently-seen packet id cache
//! - [`neighbours`] - link tracking and the per-neighbour circuit breaker
//! - [`session`] - authenticated client sessions
//! - [`mailbox`] - store-and-forward for offline destinations
//! - [`limiter`] - per-category rate limits and quiet hours
//! - [`storage`] - persistent block layout and codecs
//! - [`stats`] - lifetime counters
//! - [`error`] - engine error type

#![warn(missing_docs)]

pub mod dedup;
pub mod engine;
pub mod error;
pub mod forward;
pub mod hal;
pub mod limiter;
pub mod mailbox;
pub mod neighbours;
pub mod session;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use engine::{Engine, EngineCommand, EngineExit, EngineHandle, EngineStatus};
pub use error::{EngineError, Result};
pub use hal::{event_channel, Clock, MonotonicClock, Radio, RadioEvent, RadioEventSender};
pub use storage::{BlockId, BlockStorage, StorageError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
