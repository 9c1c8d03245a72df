//! Store-and-forward mailbox for offline destinations
//!
//! Two small tiers: a persisted tier that round-trips through the storage
//! layer and a larger volatile tier. Entries are deduplicated by destination
//! plus payload fingerprint and expire after a TTL; expiry is applied lazily
//! on store and drain plus a periodic sweep.

use tracing::{debug, trace};

/// Persisted tier capacity
pub const PERSISTED_SLOTS: usize = 2;

/// Volatile tier capacity
pub const VOLATILE_SLOTS: usize = 4;

/// Default entry TTL in seconds (24 h)
pub const DEFAULT_TTL_SECS: u32 = 86_400;

/// One stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    /// Destination node hash
    pub dest_hash: u8,
    /// Source node hash
    pub src_hash: u8,
    /// Epoch seconds when stored
    pub stored_at: u32,
    /// Seconds until expiry
    pub ttl_secs: u32,
    /// Original packet payload
    pub payload: Vec<u8>,
}

impl MailboxEntry {
    /// DJB2 fingerprint of the payload, used for duplicate detection
    pub fn fingerprint(&self) -> u32 {
        fingerprint(&self.payload)
    }

    fn expired(&self, now_secs: u32) -> bool {
        now_secs.saturating_sub(self.stored_at) >= self.ttl_secs
    }
}

fn fingerprint(payload: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in payload {
        hash = (hash.wrapping_shl(5).wrapping_add(hash)) ^ byte as u32;
    }
    hash
}

/// Outcome of a store attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored in the persisted tier
    StoredPersisted,
    /// Stored in the volatile tier
    StoredVolatile,
    /// An equivalent entry already exists
    Duplicate,
}

/// Two-tier mailbox
#[derive(Debug, Default)]
pub struct Mailbox {
    persisted: Vec<MailboxEntry>,
    volatile: Vec<MailboxEntry>,
    dirty: bool,
}

impl Mailbox {
    /// Empty mailbox
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    /// Store a message for an offline destination
    pub fn store(
        &mut self,
        dest_hash: u8,
        src_hash: u8,
        payload: Vec<u8>,
        now_secs: u32,
    ) -> StoreOutcome {
        self.purge_expired(now_secs);

        let fp = fingerprint(&payload);
        let duplicate = self
            .persisted
            .iter()
            .chain(self.volatile.iter())
            .any(|e| e.dest_hash == dest_hash && e.fingerprint() == fp);
        if duplicate {
            trace!(dest = format_args!("{:02x}", dest_hash), "mailbox duplicate ignored");
            return StoreOutcome::Duplicate;
        }

        let entry = MailboxEntry {
            dest_hash,
            src_hash,
            stored_at: now_secs,
            ttl_secs: DEFAULT_TTL_SECS,
            payload,
        };

        if self.persisted.len() < PERSISTED_SLOTS {
            self.persisted.push(entry);
            self.dirty = true;
            return StoreOutcome::StoredPersisted;
        }
        if self.volatile.len() >= VOLATILE_SLOTS {
            // Both tiers full: evict the oldest entry, volatile preferred.
            let oldest_volatile = self
                .volatile
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(i, _)| i)
                .expect("volatile tier is full");
            let evicted = self.volatile.remove(oldest_volatile);
            debug!(dest = format_args!("{:02x}", evicted.dest_hash), "mailbox entry evicted");
        }
        self.volatile.push(entry);
        StoreOutcome::StoredVolatile
    }

    /// Remove and return every live entry addressed to `dest_hash`
    pub fn drain_for(&mut self, dest_hash: u8, now_secs: u32) -> Vec<MailboxEntry> {
        self.purge_expired(now_secs);
        let mut drained = Vec::new();
        let before = self.persisted.len();
        self.persisted.retain(|e| {
            if e.dest_hash == dest_hash {
                drained.push(e.clone());
                false
            } else {
                true
            }
        });
        if self.persisted.len() != before {
            self.dirty = true;
        }
        self.volatile.retain(|e| {
            if e.dest_hash == dest_hash {
                drained.push(e.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    /// Live entries waiting for `dest_hash`
    pub fn count_for(&self, dest_hash: u8) -> usize {
        self.persisted
            .iter()
            .chain(self.volatile.iter())
            .filter(|e| e.dest_hash == dest_hash)
            .count()
    }

    /// Drop expired entries
    pub fn purge_expired(&mut self, now_secs: u32) {
        let before = self.persisted.len();
        self.persisted.retain(|e| !e.expired(now_secs));
        if self.persisted.len() != before {
            self.dirty = true;
        }
        self.volatile.retain(|e| !e.expired(now_secs));
    }

    /// Total live entries
    pub fn len(&self) -> usize {
        self.persisted.len() + self.volatile.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persisted-tier entries for the storage layer
    pub fn persisted_entries(&self) -> &[MailboxEntry] {
        &self.persisted
    }

    /// Restore the persisted tier from storage
    pub fn load_persisted(&mut self, entries: Vec<MailboxEntry>) {
        self.persisted = entries;
        self.persisted.truncate(PERSISTED_SLOTS);
    }

    /// True when the persisted tier changed since the last flush
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
