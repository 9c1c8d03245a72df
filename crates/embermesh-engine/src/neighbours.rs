//! Neighbour tracking, link health and the per-neighbour circuit breaker
//!
//! A fixed arena of recently heard nodes keyed by node hash. Each entry
//! keeps smoothed link quality (EMA over SNR) and a circuit breaker that
//! suppresses direct forwarding through links too weak to be useful.
//! SNR values are carried in quarter-dB units throughout (`snr4`).

use embermesh_core::identity::NodeKind;
use embermesh_protocol::Advert;
use tracing::{debug, trace};

/// Arena capacity
pub const MAX_NEIGHBOURS: usize = 16;

/// A node unheard for this long counts as offline
pub const OFFLINE_AFTER_MS: u64 = 1_800_000;

/// Offline detection needs at least this many recorded packets
pub const OFFLINE_MIN_PACKETS: u32 = 2;

/// Breaker opens when smoothed SNR falls below this (-10 dB)
pub const BREAKER_OPEN_BELOW_SNR4: i16 = -40;

/// Open breaker cooldown before a trial is allowed
pub const BREAKER_COOLDOWN_MS: u64 = 300_000;

/// Per-neighbour circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Link healthy; direct forwarding allowed
    Closed,
    /// Link too weak; direct forwarding suppressed until cooldown
    Open {
        /// Uptime when the breaker opened
        since_ms: u64,
    },
    /// Cooldown elapsed; the next sample decides
    HalfOpen,
}

/// One tracked neighbour
#[derive(Debug, Clone)]
pub struct Neighbour {
    /// Node hash (first public key byte)
    pub hash: u8,
    /// Full public key, once learned from an advert
    pub pubkey: Option<[u8; 32]>,
    /// Advertised name, once learned
    pub name: Option<String>,
    /// Advertised node kind, once learned
    pub kind: Option<NodeKind>,
    /// RSSI of the most recent packet (dBm)
    pub last_rssi: i16,
    /// SNR of the most recent packet (quarter dB)
    pub last_snr4: i16,
    /// Smoothed SNR (quarter dB), 7/8 old + 1/8 new
    pub ema_snr4: i16,
    /// Packets recorded from this node
    pub packets: u32,
    /// Uptime when last heard
    pub last_seen_ms: u64,
    offline_alerted: bool,
    breaker: BreakerState,
}

impl Neighbour {
    fn new(hash: u8, rssi: i16, snr4: i16, now_ms: u64) -> Neighbour {
        Neighbour {
            hash,
            pubkey: None,
            name: None,
            kind: None,
            last_rssi: rssi,
            last_snr4: snr4,
            ema_snr4: snr4,
            packets: 1,
            last_seen_ms: now_ms,
            offline_alerted: false,
            breaker: BreakerState::Closed,
        }
    }

    fn sample(&mut self, rssi: i16, snr4: i16, now_ms: u64) {
        self.last_rssi = rssi;
        self.last_snr4 = snr4;
        self.ema_snr4 = ((self.ema_snr4 as i32 * 7 + snr4 as i32) / 8) as i16;
        self.packets = self.packets.saturating_add(1);
        self.last_seen_ms = now_ms;
        self.offline_alerted = false;
        self.update_breaker(now_ms);
    }

    fn update_breaker(&mut self, now_ms: u64) {
        let weak = self.ema_snr4 < BREAKER_OPEN_BELOW_SNR4;
        self.breaker = match self.breaker {
            BreakerState::Closed if weak => {
                debug!(hash = format_args!("{:02x}", self.hash), ema = self.ema_snr4,
                    "circuit breaker opened");
                BreakerState::Open { since_ms: now_ms }
            }
            BreakerState::Closed => BreakerState::Closed,
            BreakerState::Open { since_ms }
                if now_ms.saturating_sub(since_ms) < BREAKER_COOLDOWN_MS =>
            {
                BreakerState::Open { since_ms }
            }
            // Cooldown elapsed: this sample decides recovery or re-open.
            BreakerState::Open { .. } | BreakerState::HalfOpen => {
                if weak {
                    BreakerState::Open { since_ms: now_ms }
                } else {
                    debug!(hash = format_args!("{:02x}", self.hash), "circuit breaker closed");
                    BreakerState::Closed
                }
            }
        };
    }

    /// Current breaker state, surfacing HalfOpen once cooldown has elapsed
    pub fn breaker_state(&self, now_ms: u64) -> BreakerState {
        match self.breaker {
            BreakerState::Open { since_ms }
                if now_ms.saturating_sub(since_ms) >= BREAKER_COOLDOWN_MS =>
            {
                BreakerState::HalfOpen
            }
            other => other,
        }
    }

    /// True when direct forwarding through this neighbour is allowed
    pub fn breaker_allows(&self, now_ms: u64) -> bool {
        !matches!(self.breaker_state(now_ms), BreakerState::Open { .. })
    }

    fn is_offline(&self, now_ms: u64) -> bool {
        self.packets >= OFFLINE_MIN_PACKETS
            && now_ms.saturating_sub(self.last_seen_ms) > OFFLINE_AFTER_MS
    }
}

/// Fixed arena of neighbours with least-recently-seen eviction
#[derive(Debug, Default)]
pub struct NeighbourTable {
    entries: Vec<Neighbour>,
}

impl NeighbourTable {
    /// Empty table
    pub fn new() -> NeighbourTable {
        NeighbourTable::default()
    }

    /// Record a packet heard from `hash`, creating or refreshing its entry
    pub fn record(&mut self, hash: u8, rssi: i16, snr4: i16, now_ms: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|n| n.hash == hash) {
            entry.sample(rssi, snr4, now_ms);
            return;
        }
        if self.entries.len() >= MAX_NEIGHBOURS {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.last_seen_ms)
                .map(|(i, _)| i)
                .expect("table is non-empty");
            let evicted = self.entries.swap_remove(oldest);
            trace!(hash = format_args!("{:02x}", evicted.hash), "neighbour evicted");
        }
        self.entries.push(Neighbour::new(hash, rssi, snr4, now_ms));
    }

    /// Refresh last-seen for a node whose hash was observed without an
    /// attributable link measurement (e.g. the originator of a relayed
    /// packet). Creates a minimal entry when the node is unknown; never
    /// feeds the SNR average or the packet count of an existing entry.
    pub fn touch(&mut self, hash: u8, now_ms: u64) {
        match self.entries.iter_mut().find(|n| n.hash == hash) {
            Some(entry) => {
                entry.last_seen_ms = now_ms;
                entry.offline_alerted = false;
            }
            None => self.record(hash, 0, 0, now_ms),
        }
    }

    /// Fold a verified advert into the table. Returns true the first time a
    /// named entry appears (new-node alert edge).
    pub fn enrich_from_advert(&mut self, advert: &Advert, now_ms: u64) -> bool {
        let hash = advert.node_hash();
        if self.entries.iter().all(|n| n.hash != hash) {
            // record() was not called for this frame; seed an entry so the
            // advert has somewhere to land.
            self.record(hash, 0, 0, now_ms);
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|n| n.hash == hash)
            .expect("entry just ensured");
        let newly_named = entry.name.is_none() && advert.name.is_some();
        entry.pubkey = Some(advert.pubkey);
        if advert.name.is_some() {
            entry.name = advert.name.clone();
        }
        if let Some(kind) = advert.kind() {
            entry.kind = Some(kind);
        }
        newly_named
    }

    /// Entries that just crossed the offline edge; each fires at most once
    /// until the node is heard again.
    pub fn take_offline_transitions(&mut self, now_ms: u64) -> Vec<Neighbour> {
        let mut fired = Vec::new();
        for entry in &mut self.entries {
            if entry.is_offline(now_ms) && !entry.offline_alerted {
                entry.offline_alerted = true;
                fired.push(entry.clone());
            }
        }
        fired
    }

    /// Look up by node hash
    pub fn get(&self, hash: u8) -> Option<&Neighbour> {
        self.entries.iter().find(|n| n.hash == hash)
    }

    /// True when direct forwarding through `hash` is allowed. Unknown
    /// neighbours are allowed; the breaker only trips on measured links.
    pub fn breaker_allows(&self, hash: u8, now_ms: u64) -> bool {
        self.get(hash).map_or(true, |n| n.breaker_allows(now_ms))
    }

    /// True when `hash` has been offline long enough for mailbox capture
    pub fn is_offline(&self, hash: u8, now_ms: u64) -> bool {
        self.get(hash).is_some_and(|n| n.is_offline(now_ms))
    }

    /// Average smoothed SNR over nodes heard within the offline window
    pub fn avg_ema_snr4(&self, now_ms: u64) -> Option<i16> {
        let live: Vec<i32> = self
            .entries
            .iter()
            .filter(|n| now_ms.saturating_sub(n.last_seen_ms) <= OFFLINE_AFTER_MS)
            .map(|n| n.ema_snr4 as i32)
            .collect();
        if live.is_empty() {
            return None;
        }
        Some((live.iter().sum::<i32>() / live.len() as i32) as i16)
    }

    /// Number of tracked neighbours
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no neighbours are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.entries.iter()
    }
}
