//! UDP-backed radio driver
//!
//! Frames travel as raw datagrams between configured peers. UDP has no RF
//! front end, so received frames carry fixed nominal link metrics; the rest
//! of the engine behaves exactly as it would over a real radio.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use embermesh_engine::hal::{Radio, RadioEvent, RadioEventSender, RadioFault};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest frame we accept off the wire
const MAX_DATAGRAM: usize = 512;

/// Nominal RSSI reported for UDP links
const NOMINAL_RSSI_DBM: i16 = -70;

/// Nominal SNR reported for UDP links (quarter dB)
const NOMINAL_SNR4: i16 = 24;

/// Radio collaborator speaking raw frames over UDP
pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    events: RadioEventSender,
    tx_power_dbm: i8,
}

impl UdpRadio {
    /// Bind the socket and start the receive loop. The returned task feeds
    /// received datagrams into the engine's event channel until aborted.
    pub async fn bind(
        listen: SocketAddr,
        peers: Vec<SocketAddr>,
        events: RadioEventSender,
    ) -> anyhow::Result<(UdpRadio, JoinHandle<()>)> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        info!(addr = %socket.local_addr()?, peers = peers.len(), "udp radio listening");

        let rx_socket = socket.clone();
        let rx_events = events.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                match rx_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!(%from, len, "datagram received");
                        rx_events.send(RadioEvent::Received {
                            frame: buf[..len].to_vec(),
                            rssi: NOMINAL_RSSI_DBM,
                            snr4: NOMINAL_SNR4,
                        });
                    }
                    Err(error) => {
                        warn!(%error, "udp receive failed");
                    }
                }
            }
        });

        Ok((
            UdpRadio {
                socket,
                peers,
                events,
                tx_power_dbm: 0,
            },
            task,
        ))
    }
}

#[async_trait]
impl Radio for UdpRadio {
    async fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioFault> {
        for peer in &self.peers {
            self.socket
                .send_to(frame, peer)
                .await
                .map_err(|e| RadioFault(format!("send to {peer}: {e}")))?;
        }
        self.events.send(RadioEvent::TxComplete);
        Ok(())
    }

    async fn channel_busy(&mut self) -> bool {
        false
    }

    async fn reset(&mut self) -> Result<(), RadioFault> {
        info!("udp radio reset (no-op)");
        Ok(())
    }

    async fn set_tx_power(&mut self, dbm: i8) -> Result<(), RadioFault> {
        self.tx_power_dbm = dbm;
        debug!(dbm, "tx power recorded");
        Ok(())
    }
}
