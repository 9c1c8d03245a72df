//! Persistent storage blocks
//!
//! State survives reboots in three independently validated blocks behind a
//! byte-oriented trait. Each block carries its own magic and version (the
//! stats block adds a CRC-16); a block that fails validation is
//! reinitialized to defaults without touching the others, so corruption is
//! always block-scoped.

use async_trait::async_trait;
use embermesh_core::config::{QuietHours, RepeaterConfig};
use thiserror::Error;

use crate::mailbox::MailboxEntry;
use crate::stats::LifetimeStats;

/// Config block magic
pub const CONFIG_MAGIC: u16 = 0xCC3C;
/// Config block format version
pub const CONFIG_VERSION: u8 = 1;

/// Stats block magic
pub const STATS_MAGIC: u16 = 0xE5B2;
/// Stats block format version
pub const STATS_VERSION: u8 = 1;

/// Mailbox block magic
pub const MAILBOX_MAGIC: u16 = 0xBB0F;
/// Mailbox block format version
pub const MAILBOX_VERSION: u8 = 1;

const PASSWORD_FIELD_LEN: usize = 16;

/// Which block to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// Repeater configuration
    Config,
    /// Lifetime counters
    Stats,
    /// Persisted mailbox entries
    Mailbox,
}

/// Storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend I/O failure
    #[error("storage io: {0}")]
    Io(String),

    /// Block failed magic/version/CRC validation
    #[error("{block} block corrupt: {reason}")]
    Corrupt {
        /// Which block failed
        block: &'static str,
        /// What check failed
        reason: &'static str,
    },
}

/// Byte-oriented block storage collaborator
#[async_trait]
pub trait BlockStorage: Send {
    /// Read a whole block; None when never written
    async fn read_block(&mut self, block: BlockId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a whole block
    async fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<(), StorageError>;
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn put_password(out: &mut Vec<u8>, password: &str) {
    let mut field = [0u8; PASSWORD_FIELD_LEN];
    let bytes = password.as_bytes();
    let len = bytes.len().min(PASSWORD_FIELD_LEN - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&field);
}

fn get_password(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

fn put_optional_pubkey(out: &mut Vec<u8>, key: &Option<[u8; 32]>) {
    out.push(key.is_some() as u8);
    out.extend_from_slice(&key.unwrap_or([0u8; 32]));
}

/// Encode the config block
pub fn encode_config(config: &RepeaterConfig) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&CONFIG_MAGIC.to_le_bytes());
    out.push(CONFIG_VERSION);
    put_password(&mut out, &config.admin_password);
    put_password(&mut out, &config.guest_password);
    out.push(config.report.enabled as u8);
    out.push(config.report.hour);
    out.push(config.report.minute);
    put_optional_pubkey(&mut out, &config.report.dest_pubkey);
    out.push(config.alert.enabled as u8);
    put_optional_pubkey(&mut out, &config.alert.dest_pubkey);
    match config.quiet_hours {
        Some(q) => {
            out.push(1);
            out.push(q.start_hour);
            out.push(q.end_hour);
        }
        None => out.extend_from_slice(&[0, 0, 0]),
    }
    out.push(config.radio.min_tx_power_dbm as u8);
    out.push(config.radio.max_tx_power_dbm as u8);
    out.extend_from_slice(&(config.advert_interval.as_secs() as u32).to_le_bytes());
    out
}

/// Decode and validate the config block
pub fn decode_config(data: &[u8]) -> Result<RepeaterConfig, StorageError> {
    let corrupt = |reason| StorageError::Corrupt {
        block: "config",
        reason,
    };
    if data.len() < 114 {
        return Err(corrupt("too short"));
    }
    if u16::from_le_bytes([data[0], data[1]]) != CONFIG_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if data[2] != CONFIG_VERSION {
        return Err(corrupt("bad version"));
    }
    let mut config = RepeaterConfig::default();
    let mut at = 3;
    config.admin_password = get_password(&data[at..at + PASSWORD_FIELD_LEN]);
    at += PASSWORD_FIELD_LEN;
    config.guest_password = get_password(&data[at..at + PASSWORD_FIELD_LEN]);
    at += PASSWORD_FIELD_LEN;
    config.report.enabled = data[at] != 0;
    config.report.hour = data[at + 1];
    config.report.minute = data[at + 2];
    at += 3;
    if data[at] != 0 {
        config.report.dest_pubkey = Some(data[at + 1..at + 33].try_into().expect("32 bytes"));
    }
    at += 33;
    config.alert.enabled = data[at] != 0;
    at += 1;
    if data[at] != 0 {
        config.alert.dest_pubkey = Some(data[at + 1..at + 33].try_into().expect("32 bytes"));
    }
    at += 33;
    if data[at] != 0 {
        config.quiet_hours = Some(QuietHours {
            start_hour: data[at + 1],
            end_hour: data[at + 2],
        });
    }
    at += 3;
    config.radio.min_tx_power_dbm = data[at] as i8;
    config.radio.max_tx_power_dbm = data[at + 1] as i8;
    at += 2;
    let secs = u32::from_le_bytes(data[at..at + 4].try_into().expect("4 bytes"));
    config.advert_interval = std::time::Duration::from_secs(secs as u64);
    Ok(config)
}

/// Encode the stats block
pub fn encode_stats(stats: &LifetimeStats) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + 32 + 2);
    out.extend_from_slice(&STATS_MAGIC.to_le_bytes());
    out.push(STATS_VERSION);
    let mut counters = Vec::with_capacity(32);
    for value in stats.to_array() {
        counters.extend_from_slice(&value.to_le_bytes());
    }
    let crc = crc16_ccitt(&counters);
    out.extend_from_slice(&counters);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decode and validate the stats block
pub fn decode_stats(data: &[u8]) -> Result<LifetimeStats, StorageError> {
    let corrupt = |reason| StorageError::Corrupt {
        block: "stats",
        reason,
    };
    if data.len() < 3 + 32 + 2 {
        return Err(corrupt("too short"));
    }
    if u16::from_le_bytes([data[0], data[1]]) != STATS_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if data[2] != STATS_VERSION {
        return Err(corrupt("bad version"));
    }
    let counters = &data[3..35];
    let stored_crc = u16::from_le_bytes([data[35], data[36]]);
    if crc16_ccitt(counters) != stored_crc {
        return Err(corrupt("bad crc"));
    }
    let mut values = [0u32; 8];
    for (i, chunk) in counters.chunks_exact(4).enumerate() {
        values[i] = u32::from_le_bytes(chunk.try_into().expect("4 bytes"));
    }
    Ok(LifetimeStats::from_array(values))
}

/// Encode the persisted mailbox block
pub fn encode_mailbox(entries: &[MailboxEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&MAILBOX_MAGIC.to_le_bytes());
    out.push(MAILBOX_VERSION);
    out.push(entries.len() as u8);
    for entry in entries {
        out.push(entry.dest_hash);
        out.push(entry.src_hash);
        out.extend_from_slice(&entry.stored_at.to_le_bytes());
        out.extend_from_slice(&entry.ttl_secs.to_le_bytes());
        out.push(entry.payload.len() as u8);
        out.extend_from_slice(&entry.payload);
    }
    out
}

/// Decode and validate the mailbox block
pub fn decode_mailbox(data: &[u8]) -> Result<Vec<MailboxEntry>, StorageError> {
    let corrupt = |reason| StorageError::Corrupt {
        block: "mailbox",
        reason,
    };
    if data.len() < 4 {
        return Err(corrupt("too short"));
    }
    if u16::from_le_bytes([data[0], data[1]]) != MAILBOX_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if data[2] != MAILBOX_VERSION {
        return Err(corrupt("bad version"));
    }
    let count = data[3] as usize;
    let mut entries = Vec::with_capacity(count);
    let mut at = 4;
    for _ in 0..count {
        if data.len() < at + 11 {
            return Err(corrupt("entry truncated"));
        }
        let dest_hash = data[at];
        let src_hash = data[at + 1];
        let stored_at = u32::from_le_bytes(data[at + 2..at + 6].try_into().expect("4 bytes"));
        let ttl_secs = u32::from_le_bytes(data[at + 6..at + 10].try_into().expect("4 bytes"));
        let len = data[at + 10] as usize;
        at += 11;
        if data.len() < at + len {
            return Err(corrupt("payload truncated"));
        }
        entries.push(MailboxEntry {
            dest_hash,
            src_hash,
            stored_at,
            ttl_secs,
            payload: data[at..at + len].to_vec(),
        });
        at += len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn crc16_known_vector() {
        // CRC-16/CCITT-FALSE("123456789") = 0x29B1
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn config_round_trip() {
        let mut config = RepeaterConfig::default();
        config.admin_password = "s3cret".into();
        config.report.enabled = true;
        config.report.hour = 7;
        config.report.minute = 30;
        config.report.dest_pubkey = Some([0xAB; 32]);
        config.quiet_hours = Some(QuietHours {
            start_hour: 22,
            end_hour: 6,
        });
        config.advert_interval = Duration::from_secs(1800);

        let back = decode_config(&encode_config(&config)).unwrap();
        assert_eq!(back.admin_password, "s3cret");
        assert_eq!(back.guest_password, config.guest_password);
        assert!(back.report.enabled);
        assert_eq!(back.report.dest_pubkey, Some([0xAB; 32]));
        assert_eq!(back.quiet_hours, config.quiet_hours);
        assert_eq!(back.advert_interval, Duration::from_secs(1800));
    }

    #[test]
    fn config_bad_magic_rejected() {
        let mut data = encode_config(&RepeaterConfig::default());
        data[0] ^= 0xFF;
        assert!(matches!(
            decode_config(&data),
            Err(StorageError::Corrupt { block: "config", .. })
        ));
    }

    #[test]
    fn stats_round_trip_and_crc() {
        let stats = LifetimeStats {
            packets_received: 123,
            packets_forwarded: 45,
            ..Default::default()
        };
        let mut data = encode_stats(&stats);
        assert_eq!(decode_stats(&data).unwrap(), stats);

        // Flip one counter bit: CRC catches it.
        data[5] ^= 0x01;
        assert!(matches!(
            decode_stats(&data),
            Err(StorageError::Corrupt { block: "stats", reason: "bad crc" })
        ));
    }

    #[test]
    fn mailbox_round_trip() {
        let entries = vec![
            MailboxEntry {
                dest_hash: 1,
                src_hash: 2,
                stored_at: 1_700_000_000,
                ttl_secs: 86_400,
                payload: vec![1, 2, 3],
            },
            MailboxEntry {
                dest_hash: 9,
                src_hash: 8,
                stored_at: 1_700_000_100,
                ttl_secs: 86_400,
                payload: vec![],
            },
        ];
        let back = decode_mailbox(&encode_mailbox(&entries)).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn mailbox_truncation_rejected() {
        let entries = vec![MailboxEntry {
            dest_hash: 1,
            src_hash: 2,
            stored_at: 0,
            ttl_secs: 1,
            payload: vec![1, 2, 3],
        }];
        let data = encode_mailbox(&entries);
        assert!(matches!(
            decode_mailbox(&data[..data.len() - 2]),
            Err(StorageError::Corrupt { block: "mailbox", .. })
        ));
    }
}
