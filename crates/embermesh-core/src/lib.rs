//! Embermesh Core - identity, crypto and time primitives for the repeater
//!
//! This crate provides the foundations shared by the protocol codec and the
//! repeater engine:
//!
//! - [`identity`] - Ed25519 keypairs, node hashes and advert flags
//! - [`crypto`] - X25519 agreement and the encrypt-then-MAC session cipher
//! - [`timesync`] - consensus clock learned from advert timestamps
//! - [`config`] - repeater configuration types
//! - [`error`] - shared error type
//!
//! # Example
//!
//! ```rust
//! use embermesh_core::identity::{Keypair, NodeIdentity, NodeKind};
//!
//! let keypair = Keypair::generate();
//! let id = NodeIdentity::new(keypair, "alpine-rpt", NodeKind::Repeater, None).unwrap();
//! println!("node hash: {:02x}", id.node_hash());
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod timesync;

// Re-exports for convenience
pub use config::{AlertConfig, QuietHours, RadioConfig, RepeaterConfig, ReportConfig};
pub use crypto::{shared_secret, SessionKeys};
pub use error::{CoreError, Result};
pub use identity::{Keypair, Location, NodeIdentity, NodeKind, PublicKey};
pub use timesync::{SyncOutcome, TimeSync};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
