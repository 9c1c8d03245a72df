//! Encrypted text message wire shapes
//!
//! An addressed encrypted payload is `dest_hash(1) || src_hash(1) || sealed`
//! where `sealed` is the MAC-prefixed ciphertext. Its plaintext is
//! `timestamp(4 LE) || (kind << 2 | attempt)(1) || message bytes`.

use crate::error::{ProtocolError, Result};

/// Plain chat text
pub const TXT_KIND_PLAIN: u8 = 0;

/// CLI command/response data
pub const TXT_KIND_CLI_DATA: u8 = 1;

/// Wrap sealed bytes in an addressed payload
pub fn encode_addressed(dest_hash: u8, src_hash: u8, sealed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + sealed.len());
    out.push(dest_hash);
    out.push(src_hash);
    out.extend_from_slice(sealed);
    out
}

/// Split an addressed payload into (dest, src, sealed)
pub fn parse_addressed(payload: &[u8]) -> Result<(u8, u8, &[u8])> {
    if payload.len() < 2 {
        return Err(ProtocolError::MalformedLogin("addressed payload too short"));
    }
    Ok((payload[0], payload[1], &payload[2..]))
}

/// Build a text message plaintext
pub fn encode_text_plaintext(timestamp: u32, kind: u8, attempt: u8, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + message.len());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push((kind << 2) | (attempt & 0x03));
    out.extend_from_slice(message.as_bytes());
    out
}

/// Split a decrypted (zero-padded) text plaintext into its fields
pub fn parse_text_plaintext(plain: &[u8]) -> Result<(u32, u8, u8, String)> {
    if plain.len() < 5 {
        return Err(ProtocolError::MalformedLogin("text plaintext too short"));
    }
    let timestamp = u32::from_le_bytes(plain[..4].try_into().expect("4 bytes"));
    let kind = plain[4] >> 2;
    let attempt = plain[4] & 0x03;
    let body = &plain[5..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let message = String::from_utf8_lossy(&body[..end]).to_string();
    Ok((timestamp, kind, attempt, message))
}
