//! Login handshake wire shapes
//!
//! Anonymous login request payload:
//! `dest_hash(1) || ephemeral_pub(32) || MAC(2) || ciphertext`
//! whose plaintext is `timestamp(4 LE) || password (<=15 bytes, zero padded)`.
//!
//! The login response plaintext is a fixed 13-byte record.

use embermesh_core::crypto::{BLOCK_LEN, MAC_LEN};

use crate::error::{ProtocolError, Result};

/// Length of the login response plaintext
pub const LOGIN_RESPONSE_LEN: usize = 13;

/// Firmware/protocol revision reported in login responses
pub const FIRMWARE_VERSION: u8 = 1;

/// Longest accepted password (NUL-padded 16-byte plaintext field)
pub const MAX_PASSWORD_LEN: usize = 15;

const EPHEMERAL_OFFSET: usize = 1;
const SEALED_OFFSET: usize = 33;

/// Decoded anonymous login request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonLoginRequest {
    /// Target node hash
    pub dest_hash: u8,
    /// Client's ephemeral Ed25519 public key
    pub ephemeral_pub: [u8; 32],
    /// MAC-prefixed ciphertext
    pub sealed: Vec<u8>,
}

impl AnonLoginRequest {
    /// Encode to an AnonRequest packet payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEALED_OFFSET + self.sealed.len());
        out.push(self.dest_hash);
        out.extend_from_slice(&self.ephemeral_pub);
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Decode from an AnonRequest packet payload
    pub fn decode(payload: &[u8]) -> Result<AnonLoginRequest> {
        if payload.len() < SEALED_OFFSET + MAC_LEN + BLOCK_LEN {
            return Err(ProtocolError::MalformedLogin("request too short"));
        }
        let mut ephemeral_pub = [0u8; 32];
        ephemeral_pub.copy_from_slice(&payload[EPHEMERAL_OFFSET..SEALED_OFFSET]);
        Ok(AnonLoginRequest {
            dest_hash: payload[0],
            ephemeral_pub,
            sealed: payload[SEALED_OFFSET..].to_vec(),
        })
    }
}

/// Build the login plaintext: timestamp plus password
pub fn encode_login_plaintext(timestamp: u32, password: &str) -> Result<Vec<u8>> {
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ProtocolError::MalformedLogin("password too long"));
    }
    let mut out = Vec::with_capacity(4 + password.len());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(password.as_bytes());
    Ok(out)
}

/// Split a decrypted (zero-padded) login plaintext into timestamp and password
pub fn parse_login_plaintext(plain: &[u8]) -> Result<(u32, String)> {
    if plain.len() < 4 {
        return Err(ProtocolError::MalformedLogin("plaintext too short"));
    }
    let timestamp = u32::from_le_bytes(plain[..4].try_into().expect("4 bytes"));
    let pw_bytes = &plain[4..];
    let end = pw_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(pw_bytes.len())
        .min(MAX_PASSWORD_LEN);
    let password = String::from_utf8_lossy(&pw_bytes[..end]).to_string();
    Ok((timestamp, password))
}

/// Fixed-size login response record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginResponse {
    /// Responder's clock (epoch seconds)
    pub timestamp: u32,
    /// 0 = accepted
    pub code: u8,
    /// Keepalive interval in seconds, divided by four
    pub keepalive_div4: u8,
    /// True when admin permissions were granted
    pub is_admin: bool,
    /// Granted permission bits
    pub permissions: u8,
    /// Anti-collision nonce
    pub nonce: [u8; 4],
    /// Responder firmware revision
    pub firmware_version: u8,
}

impl LoginResponse {
    /// Encode to the 13-byte response plaintext
    pub fn encode(&self) -> [u8; LOGIN_RESPONSE_LEN] {
        let mut out = [0u8; LOGIN_RESPONSE_LEN];
        out[..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4] = self.code;
        out[5] = self.keepalive_div4;
        out[6] = self.is_admin as u8;
        out[7] = self.permissions;
        out[8..12].copy_from_slice(&self.nonce);
        out[12] = self.firmware_version;
        out
    }

    /// Decode from a (possibly padded) response plaintext
    pub fn decode(plain: &[u8]) -> Result<LoginResponse> {
        if plain.len() < LOGIN_RESPONSE_LEN {
            return Err(ProtocolError::MalformedLogin("response too short"));
        }
        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&plain[8..12]);
        Ok(LoginResponse {
            timestamp: u32::from_le_bytes(plain[..4].try_into().expect("4 bytes")),
            code: plain[4],
            keepalive_div4: plain[5],
            is_admin: plain[6] != 0,
            permissions: plain[7],
            nonce,
            firmware_version: plain[12],
        })
    }
}
