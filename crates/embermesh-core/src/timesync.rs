//! Consensus time sync from advert timestamps
//!
//! The node has no RTC worth trusting; wall-clock time is learned from the
//! mesh. The first sane advert timestamp is adopted outright. Once synced, a
//! single divergent advert can never move the clock: a candidate differing
//! by five minutes or more is cached, and only a second advert agreeing with
//! the candidate within the hour commits the new time.

use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Earliest acceptable advert timestamp (2020-01-01T00:00:00Z)
pub const MIN_SANE_TIMESTAMP: u32 = 1_577_836_800;

/// Latest acceptable advert timestamp (2100-01-01T00:00:00Z)
pub const MAX_SANE_TIMESTAMP: u32 = 4_102_444_800;

/// Divergence at or past this caches a resync candidate instead of applying
pub const RESYNC_THRESHOLD_SECS: u32 = 300;

/// A cached candidate unconfirmed for this long is discarded
pub const PENDING_WINDOW_MS: u64 = 3_600_000;

/// Result of feeding one advert timestamp into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// First sync: timestamp adopted immediately
    Adopted,
    /// Timestamp close to the local clock; nothing changed
    Ignored,
    /// Divergent timestamp cached, awaiting confirmation
    PendingCached,
    /// Second agreeing advert confirmed the pending candidate
    Committed,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    epoch: u32,
    at_ms: u64,
}

impl Anchor {
    fn project(&self, uptime_ms: u64) -> u32 {
        self.epoch
            .saturating_add(((uptime_ms.saturating_sub(self.at_ms)) / 1000) as u32)
    }
}

/// Mesh-derived clock state machine
#[derive(Debug, Default)]
pub struct TimeSync {
    anchor: Option<Anchor>,
    pending: Option<Anchor>,
}

impl TimeSync {
    /// Fresh, unsynced clock
    pub fn new() -> TimeSync {
        TimeSync::default()
    }

    /// True once a timestamp has been adopted
    pub fn is_synced(&self) -> bool {
        self.anchor.is_some()
    }

    /// True while a resync candidate awaits confirmation
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Current epoch seconds, if synced. `uptime_ms` is monotonic.
    pub fn now(&self, uptime_ms: u64) -> Option<u32> {
        self.anchor.map(|a| a.project(uptime_ms))
    }

    /// Feed one advert timestamp into the state machine
    pub fn observe(&mut self, timestamp: u32, uptime_ms: u64) -> Result<SyncOutcome> {
        if timestamp < MIN_SANE_TIMESTAMP || timestamp >= MAX_SANE_TIMESTAMP {
            return Err(CoreError::InsaneTimestamp(timestamp));
        }

        let anchor = match self.anchor {
            None => {
                info!(epoch = timestamp, "clock synced from first advert");
                self.anchor = Some(Anchor {
                    epoch: timestamp,
                    at_ms: uptime_ms,
                });
                return Ok(SyncOutcome::Adopted);
            }
            Some(a) => a,
        };

        let local = anchor.project(uptime_ms);
        if local.abs_diff(timestamp) < RESYNC_THRESHOLD_SECS {
            return Ok(SyncOutcome::Ignored);
        }

        if let Some(pending) = self.pending {
            let fresh = uptime_ms.saturating_sub(pending.at_ms) <= PENDING_WINDOW_MS;
            let agrees = pending.project(uptime_ms).abs_diff(timestamp) < RESYNC_THRESHOLD_SECS;
            if fresh && agrees {
                info!(
                    old_epoch = local,
                    new_epoch = timestamp,
                    "clock resynced on confirming advert"
                );
                self.anchor = Some(Anchor {
                    epoch: timestamp,
                    at_ms: uptime_ms,
                });
                self.pending = None;
                return Ok(SyncOutcome::Committed);
            }
        }

        debug!(
            local,
            candidate = timestamp,
            "divergent timestamp cached pending confirmation"
        );
        self.pending = Some(Anchor {
            epoch: timestamp,
            at_ms: uptime_ms,
        });
        Ok(SyncOutcome::PendingCached)
    }

    /// Drop a pending candidate that was never confirmed
    pub fn tick(&mut self, uptime_ms: u64) {
        if let Some(pending) = self.pending {
            if uptime_ms.saturating_sub(pending.at_ms) > PENDING_WINDOW_MS {
                debug!(candidate = pending.epoch, "unconfirmed resync candidate discarded");
                self.pending = None;
            }
        }
    }
}
