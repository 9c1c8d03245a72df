//! Lifetime statistics counters
//!
//! Counters survive reboots via the stats storage block. Wraparound is not
//! handled; u32 at repeater traffic rates outlives the hardware.

/// Persistent lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeStats {
    /// Frames received (pre-filter)
    pub packets_received: u32,
    /// Frames relayed
    pub packets_forwarded: u32,
    /// Frames dropped for any reason
    pub packets_dropped: u32,
    /// Duplicates suppressed
    pub dedup_hits: u32,
    /// Valid adverts processed
    pub adverts_seen: u32,
    /// Successful logins
    pub logins: u32,
    /// Engine (re)starts
    pub reboots: u32,
    /// Radio errors observed
    pub radio_errors: u32,
}

impl LifetimeStats {
    /// Counters as a fixed array, in storage order
    pub fn to_array(&self) -> [u32; 8] {
        [
            self.packets_received,
            self.packets_forwarded,
            self.packets_dropped,
            self.dedup_hits,
            self.adverts_seen,
            self.logins,
            self.reboots,
            self.radio_errors,
        ]
    }

    /// Rebuild from the storage-order array
    pub fn from_array(values: [u32; 8]) -> LifetimeStats {
        LifetimeStats {
            packets_received: values[0],
            packets_forwarded: values[1],
            packets_dropped: values[2],
            dedup_hits: values[3],
            adverts_seen: values[4],
            logins: values[5],
            reboots: values[6],
            radio_errors: values[7],
        }
    }

    /// One-line summary used in daily reports
    pub fn report_line(&self) -> String {
        format!(
            "rx:{} fwd:{} drop:{} dup:{} adv:{} login:{} boot:{} rferr:{}",
            self.packets_received,
            self.packets_forwarded,
            self.packets_dropped,
            self.dedup_hits,
            self.adverts_seen,
            self.logins,
            self.reboots,
            self.radio_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_round_trip() {
        let stats = LifetimeStats {
            packets_received: 1,
            packets_forwarded: 2,
            packets_dropped: 3,
            dedup_hits: 4,
            adverts_seen: 5,
            logins: 6,
            reboots: 7,
            radio_errors: 8,
        };
        assert_eq!(LifetimeStats::from_array(stats.to_array()), stats);
    }

    #[test]
    fn report_line_mentions_all_counters() {
        let line = LifetimeStats::default().report_line();
        for key in ["rx:", "fwd:", "drop:", "dup:", "adv:", "login:", "boot:", "rferr:"] {
            assert!(line.contains(key), "missing {key}");
        }
    }
}
