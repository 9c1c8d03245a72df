//! Error types for embermesh core primitives

use thiserror::Error;

/// Result alias using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by identity, crypto and time handling
#[derive(Debug, Error)]
pub enum CoreError {
    // ===== Identity errors =====
    /// Key material had the wrong length or failed to parse
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Node name exceeds the wire limit
    #[error("node name too long: {len} bytes (max {max})")]
    NameTooLong {
        /// Actual length in bytes
        len: usize,
        /// Maximum allowed
        max: usize,
    },

    // ===== Signature errors =====
    /// Ed25519 signature did not verify
    #[error("signature verification failed")]
    BadSignature,

    // ===== Symmetric crypto errors =====
    /// Message authentication code did not match
    #[error("MAC verification failed")]
    MacMismatch,

    /// Ciphertext length is not usable (too short or not block aligned)
    #[error("bad ciphertext length: {0}")]
    BadCiphertextLength(usize),

    /// Plaintext too large for the payload budget
    #[error("plaintext too large: {0} bytes")]
    PlaintextTooLarge(usize),

    // ===== Time errors =====
    /// Timestamp falls outside the accepted sanity window
    #[error("timestamp {0} outside sane range")]
    InsaneTimestamp(u32),
}

impl CoreError {
    /// Stable numeric code for logging and stats bucketing
    pub fn error_code(&self) -> u16 {
        match self {
            CoreError::InvalidKey(_) => 100,
            CoreError::NameTooLong { .. } => 101,
            CoreError::BadSignature => 200,
            CoreError::MacMismatch => 300,
            CoreError::BadCiphertextLength(_) => 301,
            CoreError::PlaintextTooLarge(_) => 302,
            CoreError::InsaneTimestamp(_) => 400,
        }
    }

    /// True for failures caused by remote input rather than local state
    pub fn is_remote_fault(&self) -> bool {
        !matches!(self, CoreError::PlaintextTooLarge(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let errors = [
            CoreError::InvalidKey("x".into()),
            CoreError::NameTooLong { len: 20, max: 15 },
            CoreError::BadSignature,
            CoreError::MacMismatch,
            CoreError::BadCiphertextLength(3),
            CoreError::PlaintextTooLarge(999),
            CoreError::InsaneTimestamp(1),
        ];
        let mut codes: Vec<u16> = errors.iter().map(|e| e.error_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn display_formats() {
        let err = CoreError::NameTooLong { len: 20, max: 15 };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("15"));
    }
}
