//! Forwarding decisions, channel access timing and adaptive TX power
//!
//! Relay timing is SNR-weighted: the better a station hears the sender, the
//! longer it waits before re-emitting a flood. Stations at the edge of the
//! sender's range therefore claim the channel first, which is what extends
//! the mesh; close-in repeaters mostly end up suppressed by the dedup cache
//! before their slot comes up.

use embermesh_core::config::RadioConfig;
use embermesh_protocol::{Packet, PayloadType, RouteType};
use rand::Rng;

/// Frames below this RSSI are dropped before any processing
pub const RSSI_FLOOR_DBM: i16 = -120;

/// SNR score clamp, quarter-dB units
pub const SNR_SCORE_MIN_SNR4: i16 = -80;
/// SNR score clamp, quarter-dB units
pub const SNR_SCORE_MAX_SNR4: i16 = 60;

/// Highest SNR score / maximum RX delay in slots
pub const MAX_DELAY_SLOTS: u32 = 10;

/// Maximum TX jitter in slots
pub const MAX_JITTER_SLOTS: u32 = 6;

/// TX power adjustment step
pub const POWER_STEP_DBM: i8 = 2;

/// Average smoothed SNR above this steps power down (10 dB)
pub const POWER_DOWN_ABOVE_SNR4: i16 = 40;

/// Average smoothed SNR below this steps power up (-5 dB)
pub const POWER_UP_BELOW_SNR4: i16 = -20;

/// Bounded queue of scheduled transmissions
pub const TX_QUEUE_SLOTS: usize = 4;

/// Why a packet was not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// RSSI below the floor
    WeakSignal,
    /// Our hash already appears in the path
    LoopDetected,
    /// Direct packet whose next hop is not us
    NotNextHop,
    /// Flood path already at capacity
    PathFull,
}

/// Relay decision for one received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Do not relay
    Drop(DropReason),
    /// Addressed to this node; consume locally
    Consume,
    /// Flood: append own hash and re-emit
    RelayFlood,
    /// Direct: peel own hash off the path and re-emit
    RelayDirect,
}

/// True for payload types whose first byte is a destination node hash and
/// whose second byte carries the originator's hash
pub fn is_addressed_type(payload_type: PayloadType) -> bool {
    matches!(
        payload_type,
        PayloadType::Request
            | PayloadType::Response
            | PayloadType::AnonRequest
            | PayloadType::TextMessage
    )
}

/// Decide what to do with a received packet
pub fn decide(packet: &Packet, our_hash: u8, rssi: i16) -> ForwardDecision {
    if rssi < RSSI_FLOOR_DBM {
        return ForwardDecision::Drop(DropReason::WeakSignal);
    }
    if is_addressed_type(packet.payload_type) && packet.payload().first() == Some(&our_hash) {
        return ForwardDecision::Consume;
    }
    match packet.route {
        r if r.is_flood() => {
            if packet.path_contains(our_hash) {
                ForwardDecision::Drop(DropReason::LoopDetected)
            } else if packet.path().len() >= embermesh_protocol::MAX_PATH_LEN {
                ForwardDecision::Drop(DropReason::PathFull)
            } else {
                ForwardDecision::RelayFlood
            }
        }
        _ => {
            if packet.path().first() == Some(&our_hash) {
                ForwardDecision::RelayDirect
            } else {
                ForwardDecision::Drop(DropReason::NotNextHop)
            }
        }
    }
}

/// Map quarter-dB SNR onto a 0..=10 score
pub fn snr_score(snr4: i16) -> u32 {
    let clamped = snr4.clamp(SNR_SCORE_MIN_SNR4, SNR_SCORE_MAX_SNR4) as i32;
    (((clamped - SNR_SCORE_MIN_SNR4 as i32) * MAX_DELAY_SLOTS as i32)
        / (SNR_SCORE_MAX_SNR4 - SNR_SCORE_MIN_SNR4) as i32) as u32
}

/// Rough airtime estimate for a frame of `len` bytes, in milliseconds
pub fn estimate_airtime_ms(len: usize) -> u64 {
    // Preamble plus per-byte cost at a mid SF; only relative scale matters
    // for slot timing.
    40 + 2 * len as u64
}

/// Slot length used for delay and jitter: twice the frame airtime
pub fn slot_ms(frame_len: usize) -> u64 {
    2 * estimate_airtime_ms(frame_len)
}

/// Delay before re-emitting a flood, monotonically non-decreasing in SNR.
/// Strong receivers wait longest; distant stations transmit first.
pub fn rx_delay_ms(snr4: i16, frame_len: usize) -> u64 {
    snr_score(snr4) as u64 * slot_ms(frame_len)
}

/// Random 0..=6 slot jitter applied to every transmission
pub fn tx_jitter_ms<R: Rng>(rng: &mut R, frame_len: usize) -> u64 {
    rng.gen_range(0..=MAX_JITTER_SLOTS as u64) * slot_ms(frame_len)
}

/// Step TX power against the average neighbourhood SNR
pub fn adjust_tx_power(current: i8, avg_snr4: Option<i16>, limits: &RadioConfig) -> i8 {
    let Some(avg) = avg_snr4 else {
        return current;
    };
    let next = if avg > POWER_DOWN_ABOVE_SNR4 {
        current - POWER_STEP_DBM
    } else if avg < POWER_UP_BELOW_SNR4 {
        current + POWER_STEP_DBM
    } else {
        current
    };
    next.clamp(limits.min_tx_power_dbm, limits.max_tx_power_dbm)
}

/// A frame waiting for its transmit slot
#[derive(Debug, Clone)]
pub struct QueuedTx {
    /// Encoded frame
    pub frame: Vec<u8>,
    /// Uptime before which the frame must not be sent
    pub due_ms: u64,
}

/// Bounded, due-time ordered transmit queue
#[derive(Debug, Default)]
pub struct TxQueue {
    entries: Vec<QueuedTx>,
    dropped: u64,
}

impl TxQueue {
    /// Empty queue
    pub fn new() -> TxQueue {
        TxQueue::default()
    }

    /// Queue a frame; a full queue drops the newcomer and returns false
    pub fn push(&mut self, frame: Vec<u8>, due_ms: u64) -> bool {
        if self.entries.len() >= TX_QUEUE_SLOTS {
            self.dropped += 1;
            return false;
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.due_ms > due_ms)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, QueuedTx { frame, due_ms });
        true
    }

    /// Take the first frame whose due time has passed
    pub fn pop_due(&mut self, now_ms: u64) -> Option<QueuedTx> {
        if self.entries.first().is_some_and(|e| e.due_ms <= now_ms) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    /// Push a frame back with a later due time (channel was busy)
    pub fn defer(&mut self, mut entry: QueuedTx, new_due_ms: u64) {
        entry.due_ms = new_due_ms;
        let pos = self
            .entries
            .iter()
            .position(|e| e.due_ms > new_due_ms)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Earliest due time, if any frame is queued
    pub fn next_due(&self) -> Option<u64> {
        self.entries.first().map(|e| e.due_ms)
    }

    /// Frames dropped to queue overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queued frame count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
