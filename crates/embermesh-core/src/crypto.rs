//! Symmetric session crypto and Ed25519 to X25519 key agreement
//!
//! Sessions ride on a shared secret agreed via X25519, using the peer's
//! Ed25519 identity key converted to Montgomery form. The shared secret is
//! hashed with SHA-256 and split into an AES-128 cipher key and an
//! HMAC-SHA256 auth key. Messages are encrypt-then-MAC with the truncated
//! MAC transmitted ahead of the ciphertext; verification happens before any
//! decryption and failure yields no plaintext.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::identity::{Keypair, PublicKey};

type HmacSha256 = Hmac<Sha256>;

/// Truncated MAC length on the wire
pub const MAC_LEN: usize = 2;

/// AES block length; plaintexts are zero-padded to this
pub const BLOCK_LEN: usize = 16;

/// Largest plaintext a single encrypted payload can carry
pub const MAX_PLAINTEXT_LEN: usize = 176;

/// Compute the X25519 shared secret between our Ed25519 key and a peer's.
///
/// The derivation (SHA-512 clamped scalar, Edwards point mapped to
/// Montgomery u-coordinate) is a compatibility contract with deployed
/// nodes and must not change.
pub fn shared_secret(ours: &Keypair, peer: &PublicKey) -> [u8; 32] {
    let scalar = ours.signing_key().to_scalar_bytes();
    let montgomery = peer.verifying_key().to_montgomery();
    x25519_dalek::x25519(scalar, montgomery.to_bytes())
}

/// Derived sub-keys for one session direction pair
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    cipher: [u8; 16],
    auth: [u8; 16],
}

impl SessionKeys {
    /// Split SHA-256(shared secret) into cipher and auth halves
    pub fn derive(shared: &[u8; 32]) -> SessionKeys {
        let digest = Sha256::digest(shared);
        let mut cipher = [0u8; 16];
        let mut auth = [0u8; 16];
        cipher.copy_from_slice(&digest[..16]);
        auth.copy_from_slice(&digest[16..]);
        SessionKeys { cipher, auth }
    }

    /// Agree with a peer and derive in one step
    pub fn agree(ours: &Keypair, peer: &PublicKey) -> SessionKeys {
        SessionKeys::derive(&shared_secret(ours, peer))
    }

    fn mac(&self, ciphertext: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.auth)
            .expect("HMAC accepts any key length");
        mac.update(ciphertext);
        mac
    }

    /// Encrypt `plaintext` and prepend the truncated MAC: `MAC(2) || cipher`
    pub fn encrypt_then_mac(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CoreError::PlaintextTooLarge(plaintext.len()));
        }
        let blocks = plaintext.len().div_ceil(BLOCK_LEN).max(1);
        let mut padded = vec![0u8; blocks * BLOCK_LEN];
        padded[..plaintext.len()].copy_from_slice(plaintext);

        let aes = Aes128::new(GenericArray::from_slice(&self.cipher));
        for chunk in padded.chunks_exact_mut(BLOCK_LEN) {
            aes.encrypt_block(GenericArray::from_mut_slice(chunk));
        }

        let tag = self.mac(&padded).finalize().into_bytes();
        let mut out = Vec::with_capacity(MAC_LEN + padded.len());
        out.extend_from_slice(&tag[..MAC_LEN]);
        out.extend_from_slice(&padded);
        Ok(out)
    }

    /// Verify the leading MAC, then decrypt. Returns the zero-padded
    /// plaintext; callers strip padding by context.
    pub fn mac_then_decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < MAC_LEN + BLOCK_LEN {
            return Err(CoreError::BadCiphertextLength(data.len()));
        }
        let (tag, ciphertext) = data.split_at(MAC_LEN);
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CoreError::BadCiphertextLength(data.len()));
        }
        // Constant-time truncated comparison; no plaintext on failure.
        self.mac(ciphertext)
            .verify_truncated_left(tag)
            .map_err(|_| CoreError::MacMismatch)?;

        let aes = Aes128::new(GenericArray::from_slice(&self.cipher));
        let mut plain = ciphertext.to_vec();
        for chunk in plain.chunks_exact_mut(BLOCK_LEN) {
            aes.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(plain)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::derive(&[7u8; 32])
    }

    #[test]
    fn ecdh_agrees_in_both_directions() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            shared_secret(&a, &b.public()),
            shared_secret(&b, &a.public())
        );
        assert_ne!(
            shared_secret(&a, &b.public()),
            shared_secret(&a, &a.public())
        );
    }

    #[test]
    fn derive_splits_digest() {
        let k1 = SessionKeys::derive(&[1u8; 32]);
        let k2 = SessionKeys::derive(&[1u8; 32]);
        let k3 = SessionKeys::derive(&[2u8; 32]);
        assert!(k1 == k2);
        assert!(k1 != k3);
    }

    #[test]
    fn round_trip_with_padding() {
        let k = keys();
        let plain = b"hello repeater";
        let wire = k.encrypt_then_mac(plain).unwrap();
        assert_eq!(wire.len(), MAC_LEN + BLOCK_LEN);
        let out = k.mac_then_decrypt(&wire).unwrap();
        assert_eq!(&out[..plain.len()], plain);
        assert!(out[plain.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let k = keys();
        let mut wire = k.encrypt_then_mac(b"secret").unwrap();
        wire[MAC_LEN] ^= 0x01;
        assert!(matches!(
            k.mac_then_decrypt(&wire),
            Err(CoreError::MacMismatch)
        ));
    }

    #[test]
    fn tampered_mac_fails_closed() {
        let k = keys();
        let mut wire = k.encrypt_then_mac(b"secret").unwrap();
        wire[0] ^= 0x80;
        assert!(matches!(
            k.mac_then_decrypt(&wire),
            Err(CoreError::MacMismatch)
        ));
    }

    #[test]
    fn short_or_ragged_input_rejected() {
        let k = keys();
        assert!(matches!(
            k.mac_then_decrypt(&[0u8; 5]),
            Err(CoreError::BadCiphertextLength(5))
        ));
        assert!(matches!(
            k.mac_then_decrypt(&[0u8; MAC_LEN + BLOCK_LEN + 1]),
            Err(CoreError::BadCiphertextLength(_))
        ));
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let wire = keys().encrypt_then_mac(b"for admin eyes").unwrap();
        let other = SessionKeys::derive(&[9u8; 32]);
        assert!(other.mac_then_decrypt(&wire).is_err());
    }

    #[test]
    fn oversized_plaintext_rejected() {
        let k = keys();
        let big = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            k.encrypt_then_mac(&big),
            Err(CoreError::PlaintextTooLarge(_))
        ));
    }

    #[test]
    fn debug_redacts_keys() {
        assert_eq!(format!("{:?}", keys()), "SessionKeys([REDACTED])");
    }
}
