//! Embermesh Protocol - wire codec for the LoRa mesh
//!
//! Frames are small: three header bytes, up to 64 path bytes (one node hash
//! per hop) and up to 180 payload bytes. This crate owns the packet framing,
//! the signed advert payload, the login handshake shapes and the encrypted
//! text shapes; it performs no I/O and holds no state.
//!
//! # Modules
//!
//! - [`packet`] - framing, header bits, dedup packet id
//! - [`advert`] - signed node advertisements
//! - [`login`] - anonymous login request/response shapes
//! - [`text`] - addressed encrypted text shapes
//! - [`error`] - codec error type

#![warn(missing_docs)]

pub mod advert;
pub mod error;
pub mod login;
pub mod packet;
pub mod text;

// Re-exports for convenience
pub use advert::{Advert, ADVERT_MIN_LEN};
pub use error::{ProtocolError, Result};
pub use login::{AnonLoginRequest, LoginResponse, FIRMWARE_VERSION, LOGIN_RESPONSE_LEN};
pub use packet::{Packet, PayloadType, RouteType, MAX_PATH_LEN, MAX_PAYLOAD_LEN};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
