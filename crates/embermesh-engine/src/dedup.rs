//! Duplicate packet suppression
//!
//! A fixed ring of recently seen packet ids. An id counts as a duplicate
//! only while its entry is younger than the age window; a legitimate
//! retransmission after the window is processed again.

use tracing::trace;

/// Ring capacity
pub const CACHE_SLOTS: usize = 32;

/// Entries older than this no longer suppress
pub const ENTRY_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    id: u32,
    at_ms: u64,
    used: bool,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Duplicates suppressed
    pub hits: u64,
    /// New ids recorded
    pub misses: u64,
}

/// Fixed-size duplicate suppression ring
#[derive(Debug)]
pub struct DedupCache {
    slots: [Slot; CACHE_SLOTS],
    next: usize,
    stats: DedupStats,
}

impl DedupCache {
    /// Empty cache
    pub fn new() -> DedupCache {
        DedupCache {
            slots: [Slot::default(); CACHE_SLOTS],
            next: 0,
            stats: DedupStats::default(),
        }
    }

    /// Returns true when `id` is a live duplicate; otherwise records it in
    /// the next ring slot, overwriting the oldest entry.
    pub fn check_and_insert(&mut self, id: u32, now_ms: u64) -> bool {
        let live = self.slots.iter().any(|s| {
            s.used && s.id == id && now_ms.saturating_sub(s.at_ms) < ENTRY_TTL_MS
        });
        if live {
            self.stats.hits += 1;
            trace!(id, "duplicate packet suppressed");
            return true;
        }
        self.slots[self.next] = Slot {
            id,
            at_ms: now_ms,
            used: true,
        };
        self.next = (self.next + 1) % CACHE_SLOTS;
        self.stats.misses += 1;
        false
    }

    /// Current statistics
    pub fn stats(&self) -> DedupStats {
        self.stats
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_submission_is_duplicate() {
        let mut cache = DedupCache::new();
        assert!(!cache.check_and_insert(0xDEAD, 0));
        assert!(cache.check_and_insert(0xDEAD, 100));
        assert_eq!(cache.stats(), DedupStats { hits: 1, misses: 1 });
    }

    #[test]
    fn aged_entry_no_longer_suppresses() {
        let mut cache = DedupCache::new();
        cache.check_and_insert(0xBEEF, 0);
        assert!(!cache.check_and_insert(0xBEEF, ENTRY_TTL_MS));
        // The re-recorded entry suppresses again.
        assert!(cache.check_and_insert(0xBEEF, ENTRY_TTL_MS + 1));
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut cache = DedupCache::new();
        for i in 0..CACHE_SLOTS as u32 {
            cache.check_and_insert(i, 0);
        }
        // Next insert evicts id 0.
        cache.check_and_insert(1000, 1);
        assert!(!cache.check_and_insert(0, 2));
        // Id 1 is still present.
        assert!(cache.check_and_insert(1, 3));
    }
}
