//! Protocol codec errors

use embermesh_core::CoreError;
use thiserror::Error;

/// Result alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    // ===== Framing errors =====
    /// Frame shorter than the fixed header
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Declared path length exceeds the wire maximum
    #[error("path too long: {0} bytes")]
    PathTooLong(usize),

    /// Declared payload length exceeds the wire maximum
    #[error("payload too long: {0} bytes")]
    PayloadTooLong(usize),

    /// Declared lengths disagree with the frame size
    #[error("length mismatch: declared {declared}, frame {actual}")]
    LengthMismatch {
        /// Total length implied by the header fields
        declared: usize,
        /// Actual frame length
        actual: usize,
    },

    /// Header carries a payload type with no assigned meaning
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    /// Path already holds the maximum number of hops
    #[error("path full")]
    PathFull,

    // ===== Payload errors =====
    /// Advert payload malformed or too short
    #[error("malformed advert: {0}")]
    MalformedAdvert(&'static str),

    /// Login payload malformed or too short
    #[error("malformed login payload: {0}")]
    MalformedLogin(&'static str),

    /// Crypto or identity failure underneath the codec
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ProtocolError {
    /// True when the error indicates remote malformed input
    pub fn is_remote_fault(&self) -> bool {
        match self {
            ProtocolError::PathFull => false,
            ProtocolError::Core(e) => e.is_remote_fault(),
            _ => true,
        }
    }
}
