//! Authenticated client sessions
//!
//! Clients log in through an anonymous request encrypted to the repeater's
//! identity key with an ephemeral keypair. A successful login installs a
//! session slot holding the derived keys, granted permissions, a replay
//! high-water timestamp and the return path for responses.

use embermesh_core::config::RepeaterConfig;
use embermesh_core::crypto::SessionKeys;
use embermesh_core::identity::{Keypair, PublicKey};
use embermesh_protocol::login::{parse_login_plaintext, AnonLoginRequest};
use thiserror::Error;
use tracing::{debug, info};

/// Session table capacity
pub const MAX_SESSIONS: usize = 8;

/// Sessions idle this long are evicted
pub const SESSION_IDLE_MS: u64 = 3_600_000;

/// Permission bit: administrative commands
pub const PERM_ADMIN: u8 = 0x01;

/// Permission bit: read-only guest commands
pub const PERM_GUEST: u8 = 0x02;

/// Longest stored return path
pub const MAX_RETURN_PATH: usize = 8;

/// Why a login was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoginRejection {
    /// Ephemeral key or plaintext failed to parse
    #[error("malformed login request")]
    Malformed,
    /// MAC verification or decryption failed
    #[error("login crypto failure")]
    BadCrypto,
    /// Password matched neither admin nor guest
    #[error("wrong password")]
    BadPassword,
    /// Timestamp at or below the session high-water mark
    #[error("login replay")]
    Replay,
}

/// One authenticated client
#[derive(Debug, Clone)]
pub struct Session {
    /// Client's (ephemeral) public key
    pub pubkey: [u8; 32],
    /// Derived session keys
    pub keys: SessionKeys,
    /// Granted permission bits
    pub permissions: u8,
    /// Replay high-water mark
    pub last_timestamp: u32,
    /// Uptime of last authenticated activity
    pub last_activity_ms: u64,
    /// Reversed receive path for responses
    pub return_path: Vec<u8>,
}

impl Session {
    /// Node hash of the client
    pub fn node_hash(&self) -> u8 {
        self.pubkey[0]
    }

    /// True when the session carries every bit in `mask`
    pub fn has_permissions(&self, mask: u8) -> bool {
        self.permissions & mask == mask
    }
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginGrant {
    /// Client public key
    pub pubkey: [u8; 32],
    /// Granted permission bits
    pub permissions: u8,
    /// Admin password matched
    pub is_admin: bool,
    /// Session keys for the response
    pub keys: SessionKeys,
    /// Client's login timestamp
    pub timestamp: u32,
}

/// Fixed-capacity session table
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: Vec<Session>,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// Process an anonymous login request
    pub fn process_login(
        &mut self,
        ours: &Keypair,
        request: &AnonLoginRequest,
        config: &RepeaterConfig,
        return_path: &[u8],
        now_ms: u64,
    ) -> Result<LoginGrant, LoginRejection> {
        let ephemeral =
            PublicKey::from_bytes(&request.ephemeral_pub).map_err(|_| LoginRejection::Malformed)?;
        let keys = SessionKeys::agree(ours, &ephemeral);
        let plain = keys
            .mac_then_decrypt(&request.sealed)
            .map_err(|_| LoginRejection::BadCrypto)?;
        let (timestamp, password) =
            parse_login_plaintext(&plain).map_err(|_| LoginRejection::Malformed)?;

        let (permissions, is_admin) = if password == config.admin_password {
            (PERM_ADMIN | PERM_GUEST, true)
        } else if password == config.guest_password {
            (PERM_GUEST, false)
        } else {
            debug!("login rejected: wrong password");
            return Err(LoginRejection::BadPassword);
        };

        if let Some(existing) = self
            .slots
            .iter()
            .find(|s| s.pubkey == request.ephemeral_pub)
        {
            if timestamp <= existing.last_timestamp {
                debug!("login rejected: replayed timestamp");
                return Err(LoginRejection::Replay);
            }
        }

        let mut path = return_path.to_vec();
        path.truncate(MAX_RETURN_PATH);
        let session = Session {
            pubkey: request.ephemeral_pub,
            keys: keys.clone(),
            permissions,
            last_timestamp: timestamp,
            last_activity_ms: now_ms,
            return_path: path,
        };

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.pubkey == request.ephemeral_pub)
        {
            *slot = session;
        } else {
            if self.slots.len() >= MAX_SESSIONS {
                let oldest = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.last_activity_ms)
                    .map(|(i, _)| i)
                    .expect("table is non-empty");
                let evicted = self.slots.swap_remove(oldest);
                debug!(hash = format_args!("{:02x}", evicted.node_hash()),
                    "session evicted for newcomer");
            }
            self.slots.push(session);
        }

        info!(admin = is_admin, "client login accepted");
        Ok(LoginGrant {
            pubkey: request.ephemeral_pub,
            permissions,
            is_admin,
            keys,
            timestamp,
        })
    }

    /// Look up the active session for a node hash
    pub fn by_hash(&self, hash: u8) -> Option<&Session> {
        self.slots.iter().find(|s| s.node_hash() == hash)
    }

    /// Authenticate a request from `hash`: the timestamp must beat the
    /// replay mark and the session must hold `perm_mask`. On success the
    /// replay mark and activity time advance.
    pub fn authorize(
        &mut self,
        hash: u8,
        timestamp: u32,
        perm_mask: u8,
        now_ms: u64,
    ) -> Option<&Session> {
        let slot = self.slots.iter_mut().find(|s| s.node_hash() == hash)?;
        if timestamp <= slot.last_timestamp || !slot.has_permissions(perm_mask) {
            return None;
        }
        slot.last_timestamp = timestamp;
        slot.last_activity_ms = now_ms;
        Some(slot)
    }

    /// Evict sessions idle past the window; returns the count removed
    pub fn sweep_idle(&mut self, now_ms: u64) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|s| now_ms.saturating_sub(s.last_activity_ms) < SESSION_IDLE_MS);
        let evicted = before - self.slots.len();
        if evicted > 0 {
            debug!(evicted, "idle sessions swept");
        }
        evicted
    }

    /// Active session count
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no sessions are active
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
