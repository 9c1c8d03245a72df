//! End-to-end engine tests with mock hardware collaborators.
//!
//! Time is split in two: tokio's paused clock drives the tick interval while
//! a manually advanced [`Clock`] drives all uptime-based logic, so transmit
//! slots and timeouts resolve instantly in virtual time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use embermesh_core::config::RepeaterConfig;
use embermesh_core::crypto::SessionKeys;
use embermesh_core::identity::{Keypair, NodeIdentity, NodeKind};
use embermesh_engine::engine::{Engine, EngineExit, EngineHandle};
use embermesh_engine::hal::{
    event_channel, Clock, Radio, RadioErrorKind, RadioEvent, RadioEventSender, RadioFault,
};
use embermesh_engine::storage::{self, BlockId, BlockStorage, StorageError};
use embermesh_protocol::login::{encode_login_plaintext, AnonLoginRequest, LoginResponse};
use embermesh_protocol::{text, Advert, Packet, PayloadType, RouteType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TS: u32 = 1_700_000_000;

#[derive(Clone, Default)]
struct TestClock(Arc<AtomicU64>);

impl TestClock {
    fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn uptime_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct MockRadio {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    events: RadioEventSender,
    power: Arc<Mutex<Vec<i8>>>,
    resets: Arc<AtomicU64>,
}

#[async_trait]
impl Radio for MockRadio {
    async fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioFault> {
        let _ = self.frames.send(frame.to_vec());
        self.events.send(RadioEvent::TxComplete);
        Ok(())
    }

    async fn channel_busy(&mut self) -> bool {
        false
    }

    async fn reset(&mut self) -> Result<(), RadioFault> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_tx_power(&mut self, dbm: i8) -> Result<(), RadioFault> {
        self.power.lock().unwrap().push(dbm);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemoryStorage(Arc<Mutex<HashMap<BlockId, Vec<u8>>>>);

#[async_trait]
impl BlockStorage for MemoryStorage {
    async fn read_block(&mut self, block: BlockId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.0.lock().unwrap().get(&block).cloned())
    }

    async fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<(), StorageError> {
        self.0.lock().unwrap().insert(block, data.to_vec());
        Ok(())
    }
}

struct Rig {
    task: JoinHandle<embermesh_engine::Result<EngineExit>>,
    handle: EngineHandle,
    clock: TestClock,
    events: RadioEventSender,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    storage: MemoryStorage,
    resets: Arc<AtomicU64>,
    repeater: Keypair,
}

fn spawn_engine(config: RepeaterConfig) -> Rig {
    let keypair = Keypair::generate();
    let repeater = Keypair::from_seed(&keypair.seed());
    let identity = NodeIdentity::new(keypair, "relay-1", NodeKind::Repeater, None).unwrap();

    let (events, events_rx) = event_channel();
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let power = Arc::new(Mutex::new(Vec::new()));
    let resets = Arc::new(AtomicU64::new(0));
    let radio = MockRadio {
        frames: frames_tx,
        events: events.clone(),
        power,
        resets: resets.clone(),
    };
    let storage = MemoryStorage::default();
    let clock = TestClock::default();

    let (engine, handle) = Engine::new(
        identity,
        config,
        radio,
        storage.clone(),
        clock.clone(),
        events_rx,
    );
    let task = tokio::spawn(engine.run());
    Rig {
        task,
        handle,
        clock,
        events,
        frames,
        storage,
        resets,
        repeater,
    }
}

/// Receive the next transmitted frame, nudging the uptime clock forward so
/// queued transmit slots come due.
async fn recv_frame(rig: &mut Rig) -> Vec<u8> {
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_secs(2), rig.frames.recv()).await {
            Ok(Some(frame)) => return frame,
            Ok(None) => panic!("frame channel closed"),
            Err(_) => rig.clock.advance(5_000),
        }
    }
    panic!("no frame transmitted");
}

fn peer_advert_frame(peer: &Keypair, name: &str, timestamp: u32) -> Vec<u8> {
    let identity =
        NodeIdentity::new(Keypair::from_seed(&peer.seed()), name, NodeKind::Chat, None).unwrap();
    let payload = Advert::build(&identity, timestamp, NodeKind::Chat);
    Packet::new(RouteType::Flood, PayloadType::Advert, payload)
        .unwrap()
        .encode()
}

fn login_frame(repeater: &Keypair, client: &Keypair, password: &str, timestamp: u32) -> Vec<u8> {
    let keys = SessionKeys::agree(client, &repeater.public());
    let plain = encode_login_plaintext(timestamp, password).unwrap();
    let request = AnonLoginRequest {
        dest_hash: repeater.node_hash(),
        ephemeral_pub: client.public().to_bytes(),
        sealed: keys.encrypt_then_mac(&plain).unwrap(),
    };
    Packet::new(RouteType::Flood, PayloadType::AnonRequest, request.encode())
        .unwrap()
        .encode()
}

#[tokio::test(start_paused = true)]
async fn advert_syncs_clock_and_is_relayed() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let peer = Keypair::generate();

    rig.events.send(RadioEvent::Received {
        frame: peer_advert_frame(&peer, "phone-1", TS),
        rssi: -90,
        snr4: 20,
    });

    // The relayed advert carries the peer's key with our hash appended.
    let our_hash = rig.repeater.node_hash();
    loop {
        let frame = recv_frame(&mut rig).await;
        let packet = Packet::decode(&frame).unwrap();
        if packet.payload_type != PayloadType::Advert {
            continue;
        }
        let advert = Advert::parse(packet.payload()).unwrap();
        if advert.pubkey == peer.public().to_bytes() {
            assert_eq!(packet.path(), &[our_hash]);
            break;
        }
    }

    let status = rig.handle.status().await.unwrap();
    assert!(status.synced);
    assert!(status.clock.unwrap() >= TS);
    assert!(status.neighbours >= 1);
    assert!(status.stats.adverts_seen >= 1);

    rig.handle.shutdown().await;
    let exit = rig.task.await.unwrap().unwrap();
    assert_eq!(exit, EngineExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn duplicate_frame_suppressed() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let peer = Keypair::generate();
    let frame = peer_advert_frame(&peer, "phone-1", TS);

    for _ in 0..3 {
        rig.events.send(RadioEvent::Received {
            frame: frame.clone(),
            rssi: -90,
            snr4: 20,
        });
    }
    // Let the engine churn through the events.
    let _ = recv_frame(&mut rig).await;

    let status = rig.handle.status().await.unwrap();
    assert!(status.stats.dedup_hits >= 2);

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn admin_login_receives_decryptable_response() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let client = Keypair::generate();
    let keys = SessionKeys::agree(&client, &rig.repeater.public());

    rig.events.send(RadioEvent::Received {
        frame: login_frame(&rig.repeater, &client, "password", TS),
        rssi: -85,
        snr4: 10,
    });

    loop {
        let frame = recv_frame(&mut rig).await;
        let packet = Packet::decode(&frame).unwrap();
        if packet.payload_type != PayloadType::Response {
            continue;
        }
        assert!(packet.route.is_direct());
        let (dest, src, sealed) = text::parse_addressed(packet.payload()).unwrap();
        assert_eq!(dest, client.node_hash());
        assert_eq!(src, rig.repeater.node_hash());
        let plain = keys.mac_then_decrypt(sealed).unwrap();
        let response = LoginResponse::decode(&plain).unwrap();
        assert_eq!(response.code, 0);
        assert!(response.is_admin);
        break;
    }

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.sessions, 1);
    assert_eq!(status.stats.logins, 1);

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn wrong_password_gets_no_response() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let client = Keypair::generate();

    rig.events.send(RadioEvent::Received {
        frame: login_frame(&rig.repeater, &client, "letmein", TS),
        rssi: -85,
        snr4: 10,
    });
    // Advance far enough that any queued response would have gone out.
    rig.clock.advance(30_000);
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.sessions, 0);
    assert_eq!(status.stats.logins, 0);
    while let Ok(frame) = rig.frames.try_recv() {
        let packet = Packet::decode(&frame).unwrap();
        assert_ne!(packet.payload_type, PayloadType::Response);
    }

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn flood_already_through_us_not_relayed() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let our_hash = rig.repeater.node_hash();

    let mut packet = Packet::new(
        RouteType::Flood,
        PayloadType::TextMessage,
        vec![0x99, 0x11, 1, 2, 3],
    )
    .unwrap();
    packet.push_path_hash(our_hash).unwrap();
    rig.events.send(RadioEvent::Received {
        frame: packet.encode(),
        rssi: -90,
        snr4: 0,
    });
    rig.clock.advance(30_000);
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.stats.packets_forwarded, 0);
    assert!(status.stats.packets_dropped >= 1);

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

/// Collect transmitted frames for a bounded stretch of virtual time.
async fn drain_frames(rig: &mut Rig, rounds: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for _ in 0..rounds {
        match tokio::time::timeout(Duration::from_secs(2), rig.frames.recv()).await {
            Ok(Some(frame)) => out.push(frame),
            Ok(None) => break,
            Err(_) => rig.clock.advance(5_000),
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn originated_flood_counts_sender_as_neighbour() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let our_hash = rig.repeater.node_hash();
    // An empty path means the transmitter is the originator in payload byte 1.
    let src = our_hash.wrapping_add(1);
    let dest = our_hash.wrapping_add(2);

    let packet = Packet::new(
        RouteType::Flood,
        PayloadType::TextMessage,
        vec![dest, src, 5, 6, 7],
    )
    .unwrap();
    rig.events.send(RadioEvent::Received {
        frame: packet.encode(),
        rssi: -88,
        snr4: 12,
    });
    // The relayed copy confirms the frame was processed.
    loop {
        let frame = recv_frame(&mut rig).await;
        if Packet::decode(&frame).unwrap().payload_type == PayloadType::TextMessage {
            break;
        }
    }

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.neighbours, 1);

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn text_for_offline_node_held_and_released_once() {
    let mut rig = spawn_engine(RepeaterConfig::default());
    let our_hash = rig.repeater.node_hash();
    let sender = our_hash.wrapping_add(1);
    let relayer = our_hash.wrapping_add(2);
    let absent = loop {
        let k = Keypair::generate();
        let h = k.node_hash();
        if h != our_hash && h != sender && h != relayer {
            break k;
        }
    };
    let absent_hash = absent.node_hash();

    // Sync the clock and make the destination a known node with two packets.
    rig.events.send(RadioEvent::Received {
        frame: peer_advert_frame(&absent, "cabin", TS),
        rssi: -90,
        snr4: 20,
    });
    let mut heard = Packet::new(RouteType::Flood, PayloadType::Ack, vec![1]).unwrap();
    heard.push_path_hash(absent_hash).unwrap();
    rig.events.send(RadioEvent::Received {
        frame: heard.encode(),
        rssi: -90,
        snr4: 20,
    });
    // Events are handled in order, so once the Ack relay has gone out both
    // frames have been folded into the neighbour table.
    loop {
        let frame = recv_frame(&mut rig).await;
        if Packet::decode(&frame).unwrap().payload_type == PayloadType::Ack {
            break;
        }
    }

    // Silence well past the offline window, then a text for the absent
    // node floods past. It is relayed and a copy lands in the mailbox.
    rig.clock.advance(3_000_000);
    let text_payload = vec![absent_hash, sender, 0xAA, 0xBB, 0xCC];
    let mut text = Packet::new(
        RouteType::Flood,
        PayloadType::TextMessage,
        text_payload.clone(),
    )
    .unwrap();
    text.push_path_hash(relayer).unwrap();
    rig.events.send(RadioEvent::Received {
        frame: text.encode(),
        rssi: -90,
        snr4: 20,
    });

    // The absent node reappears by originating a flood of its own.
    let reappear = Packet::new(
        RouteType::Flood,
        PayloadType::TextMessage,
        vec![sender, absent_hash, 1, 2, 3],
    )
    .unwrap();
    rig.events.send(RadioEvent::Received {
        frame: reappear.encode(),
        rssi: -90,
        snr4: 20,
    });

    // The held copy goes out once, originated by us (single-entry path).
    let redelivered = |frames: &[Vec<u8>]| {
        frames
            .iter()
            .filter_map(|f| Packet::decode(f).ok())
            .filter(|p| {
                p.payload_type == PayloadType::TextMessage
                    && p.payload() == text_payload.as_slice()
                    && p.path() == [our_hash]
            })
            .count()
    };
    let frames = drain_frames(&mut rig, 40).await;
    assert_eq!(redelivered(&frames), 1);

    // A later advert from the same node must not release it again.
    rig.events.send(RadioEvent::Received {
        frame: peer_advert_frame(&absent, "cabin", TS + 3_600),
        rssi: -90,
        snr4: 20,
    });
    let frames = drain_frames(&mut rig, 20).await;
    assert_eq!(redelivered(&frames), 0);

    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn error_storm_resets_radio_then_requests_reboot() {
    let rig = spawn_engine(RepeaterConfig::default());

    for _ in 0..50 {
        rig.events.send(RadioEvent::Error(RadioErrorKind::Crc));
        // Keep the bounded channel from overflowing.
        tokio::task::yield_now().await;
    }

    let exit = tokio::time::timeout(Duration::from_secs(30), rig.task)
        .await
        .expect("engine should exit")
        .unwrap()
        .unwrap();
    assert_eq!(exit, EngineExit::RebootRequested);
    assert!(rig.resets.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn stats_survive_restart_and_count_boots() {
    let rig = spawn_engine(RepeaterConfig::default());
    rig.handle.shutdown().await;
    rig.task.await.unwrap().unwrap();

    let data = rig
        .storage
        .0
        .lock()
        .unwrap()
        .get(&BlockId::Stats)
        .cloned()
        .unwrap();
    let stats = storage::decode_stats(&data).unwrap();
    assert_eq!(stats.reboots, 1);
}
