//! Hardware collaborator traits and the radio event channel
//!
//! The engine owns no hardware. A radio driver pushes [`RadioEvent`]s into a
//! bounded channel through [`RadioEventSender`] (never blocking; overflow is
//! counted and dropped) and services transmissions through the [`Radio`]
//! trait. A [`Clock`] supplies monotonic uptime so tests can drive time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Default capacity of the radio event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A fault reported by the radio collaborator
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RadioFault(pub String);

/// Kind of radio error event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioErrorKind {
    /// Receive chain error
    Rx,
    /// Transmit chain error
    Tx,
    /// CRC failure on a received frame
    Crc,
}

/// Events flowing from the radio driver into the engine
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A frame arrived
    Received {
        /// Raw frame bytes
        frame: Vec<u8>,
        /// Received signal strength in dBm
        rssi: i16,
        /// Signal-to-noise ratio in quarter-dB units
        snr4: i16,
    },
    /// The in-flight transmission finished
    TxComplete,
    /// The radio reported an error
    Error(RadioErrorKind),
}

/// Transmit-side radio interface
#[async_trait]
pub trait Radio: Send {
    /// Start transmitting one frame; completion arrives as
    /// [`RadioEvent::TxComplete`]
    async fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioFault>;

    /// True while energy is detected on the channel
    async fn channel_busy(&mut self) -> bool;

    /// Reset the radio after repeated errors
    async fn reset(&mut self) -> Result<(), RadioFault>;

    /// Apply a new TX power level in dBm
    async fn set_tx_power(&mut self, dbm: i8) -> Result<(), RadioFault>;
}

/// Monotonic uptime source
pub trait Clock: Send {
    /// Milliseconds since an arbitrary fixed origin
    fn uptime_ms(&self) -> u64;
}

/// Wall-clock backed [`Clock`]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Clock anchored at construction time
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn uptime_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Non-blocking producer handle for the radio event channel
#[derive(Clone)]
pub struct RadioEventSender {
    tx: mpsc::Sender<RadioEvent>,
    dropped: Arc<AtomicU64>,
}

impl RadioEventSender {
    /// Push an event without blocking; a full channel drops it
    pub fn send(&self, event: RadioEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total, "radio event channel full, event dropped");
        }
    }

    /// Events dropped so far due to channel overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the radio event channel pair
pub fn event_channel() -> (RadioEventSender, mpsc::Receiver<RadioEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (
        RadioEventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let (tx, mut rx) = event_channel();
        for _ in 0..EVENT_CHANNEL_CAPACITY + 5 {
            tx.send(RadioEvent::TxComplete);
        }
        assert_eq!(tx.dropped(), 5);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.uptime_ms();
        let b = clock.uptime_ms();
        assert!(b >= a);
    }
}
