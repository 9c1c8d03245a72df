//! The repeater engine: one context, one task
//!
//! All mutable state lives in a single [`Engine`] owned by one task. Radio
//! events arrive through a bounded channel; a one-second tick drives
//! housekeeping. The engine never blocks on hardware: transmissions are
//! queued with their CSMA due times and released one at a time.
//!
//! Reboot is cooperative. Fault handling can only set a flag; the run loop
//! notices it at the loop boundary, flushes persistent state and returns a
//! distinct exit so the host process decides what restarting means.

use std::time::Duration;

use embermesh_core::config::RepeaterConfig;
use embermesh_core::crypto::SessionKeys;
use embermesh_core::identity::{NodeIdentity, NodeKind, PublicKey};
use embermesh_core::timesync::{SyncOutcome, TimeSync};
use embermesh_protocol::login::{AnonLoginRequest, LoginResponse, FIRMWARE_VERSION};
use embermesh_protocol::text;
use embermesh_protocol::{Advert, Packet, PayloadType, RouteType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::dedup::DedupCache;
use crate::error::Result;
use crate::forward::{self, ForwardDecision, TxQueue};
use crate::hal::{Clock, Radio, RadioErrorKind, RadioEvent};
use crate::limiter::{Category, RateLimiter};
use crate::mailbox::Mailbox;
use crate::neighbours::NeighbourTable;
use crate::session::{SessionTable, PERM_ADMIN, PERM_GUEST};
use crate::stats::LifetimeStats;
use crate::storage::{self, BlockId, BlockStorage};

/// Consecutive radio errors before the radio is reset
pub const MAX_CONSECUTIVE_RADIO_ERRORS: u32 = 5;

/// Cumulative radio errors before a reboot is requested
pub const REBOOT_RADIO_ERRORS: u32 = 50;

/// Delay before the post-sync advert
pub const POST_SYNC_ADVERT_DELAY_MS: u64 = 5_000;

/// Delay before the first advert after start
pub const BOOT_ADVERT_DELAY_MS: u64 = 10_000;

const MINUTE_MS: u64 = 60_000;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// How the run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Event channel closed or shutdown commanded
    Shutdown,
    /// Fault handling asked the host to restart the process
    RebootRequested,
}

/// Control commands from the host
#[derive(Debug)]
pub enum EngineCommand {
    /// Queue a self advert now
    SendAdvert,
    /// Snapshot engine state
    Status {
        /// Reply channel
        reply: oneshot::Sender<EngineStatus>,
    },
    /// Stop the run loop
    Shutdown,
}

/// Point-in-time engine state snapshot
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Clock synced from the mesh
    pub synced: bool,
    /// Current epoch seconds, when synced
    pub clock: Option<u32>,
    /// Tracked neighbours
    pub neighbours: usize,
    /// Active sessions
    pub sessions: usize,
    /// Mailbox entries waiting
    pub mailbox_entries: usize,
    /// Current TX power
    pub tx_power_dbm: i8,
    /// Reduced forwarding budget in effect
    pub quiet_active: bool,
    /// Lifetime counters
    pub stats: LifetimeStats,
}

/// Cloneable handle for controlling a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Ask for a state snapshot
    pub async fn status(&self) -> Option<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Queue a self advert
    pub async fn send_advert(&self) -> bool {
        self.tx.send(EngineCommand::SendAdvert).await.is_ok()
    }

    /// Stop the engine
    pub async fn shutdown(&self) -> bool {
        self.tx.send(EngineCommand::Shutdown).await.is_ok()
    }
}

/// Scoped advert presentation override.
///
/// The override exists only while the guard lives; dropping it always
/// restores the true identity, so a scheduled advert can never leak an
/// impersonated node kind.
#[derive(Debug, Default)]
struct Presentation {
    override_kind: Option<NodeKind>,
}

impl Presentation {
    fn scope(&mut self, kind: NodeKind) -> PresentationScope<'_> {
        self.override_kind = Some(kind);
        PresentationScope { state: self }
    }

    fn current(&self, base: NodeKind) -> NodeKind {
        self.override_kind.unwrap_or(base)
    }
}

struct PresentationScope<'a> {
    state: &'a mut Presentation,
}

impl PresentationScope<'_> {
    fn kind(&self, base: NodeKind) -> NodeKind {
        self.state.override_kind.unwrap_or(base)
    }
}

impl Drop for PresentationScope<'_> {
    fn drop(&mut self) {
        self.state.override_kind = None;
    }
}

/// The repeater engine context
pub struct Engine<R: Radio, S: BlockStorage, C: Clock> {
    identity: NodeIdentity,
    config: RepeaterConfig,
    radio: R,
    storage: S,
    clock: C,
    events: mpsc::Receiver<RadioEvent>,
    commands: mpsc::Receiver<EngineCommand>,

    timesync: TimeSync,
    dedup: DedupCache,
    neighbours: NeighbourTable,
    sessions: SessionTable,
    mailbox: Mailbox,
    limiter: RateLimiter,
    stats: LifetimeStats,
    txq: TxQueue,
    presentation: Presentation,

    tx_in_flight: bool,
    tx_power_dbm: i8,
    pending_advert_ms: Option<u64>,
    next_advert_ms: u64,
    last_minute_ms: u64,
    last_report_day: Option<u32>,
    consecutive_radio_errors: u32,
    cumulative_radio_errors: u32,
    pending_reboot: bool,
    rng: StdRng,
}

impl<R: Radio, S: BlockStorage, C: Clock> Engine<R, S, C> {
    /// Build an engine and its control handle
    pub fn new(
        identity: NodeIdentity,
        config: RepeaterConfig,
        radio: R,
        storage: S,
        clock: C,
        events: mpsc::Receiver<RadioEvent>,
    ) -> (Engine<R, S, C>, EngineHandle) {
        let (cmd_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let limiter = RateLimiter::new(config.quiet_hours);
        let tx_power_dbm = config.radio.max_tx_power_dbm;
        let engine = Engine {
            identity,
            config,
            radio,
            storage,
            clock,
            events,
            commands,
            timesync: TimeSync::new(),
            dedup: DedupCache::new(),
            neighbours: NeighbourTable::new(),
            sessions: SessionTable::new(),
            mailbox: Mailbox::new(),
            limiter,
            stats: LifetimeStats::default(),
            txq: TxQueue::new(),
            presentation: Presentation::default(),
            tx_in_flight: false,
            tx_power_dbm,
            pending_advert_ms: None,
            next_advert_ms: 0,
            last_minute_ms: 0,
            last_report_day: None,
            consecutive_radio_errors: 0,
            cumulative_radio_errors: 0,
            pending_reboot: false,
            rng: StdRng::from_entropy(),
        };
        (engine, EngineHandle { tx: cmd_tx })
    }

    /// Drive the engine until shutdown or a reboot request
    pub async fn run(mut self) -> Result<EngineExit> {
        self.load_persistent().await?;
        self.stats.reboots = self.stats.reboots.saturating_add(1);
        self.flush_stats().await?;
        self.radio.set_tx_power(self.tx_power_dbm).await?;

        let boot = self.clock.uptime_ms();
        self.next_advert_ms = boot + BOOT_ADVERT_DELAY_MS;
        self.last_minute_ms = boot;
        info!(
            hash = format_args!("{:02x}", self.identity.node_hash()),
            name = self.identity.name(),
            "repeater engine started"
        );

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_radio_event(event).await?,
                    None => {
                        info!("radio event channel closed");
                        self.flush_all().await?;
                        return Ok(EngineExit::Shutdown);
                    }
                },
                maybe = self.commands.recv() => match maybe {
                    Some(EngineCommand::Shutdown) | None => {
                        info!("shutdown commanded");
                        self.flush_all().await?;
                        return Ok(EngineExit::Shutdown);
                    }
                    Some(command) => self.handle_command(command),
                },
                _ = tick.tick() => self.on_tick().await?,
            }

            self.pump_tx().await?;

            if self.pending_reboot {
                warn!("cooperative reboot requested");
                self.flush_all().await?;
                return Ok(EngineExit::RebootRequested);
            }
        }
    }

    // ===== Event handling =====

    async fn handle_radio_event(&mut self, event: RadioEvent) -> Result<()> {
        match event {
            RadioEvent::Received { frame, rssi, snr4 } => {
                self.handle_frame(&frame, rssi, snr4)?;
            }
            RadioEvent::TxComplete => {
                self.tx_in_flight = false;
                self.consecutive_radio_errors = 0;
            }
            RadioEvent::Error(kind) => self.handle_radio_error(kind).await?,
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8], rssi: i16, snr4: i16) -> Result<()> {
        let now = self.clock.uptime_ms();
        let our_hash = self.identity.node_hash();
        self.stats.packets_received = self.stats.packets_received.saturating_add(1);

        if rssi < forward::RSSI_FLOOR_DBM {
            trace!(rssi, "frame below RSSI floor dropped");
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        }

        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(error) => {
                debug!(%error, "undecodable frame dropped");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
                return Ok(());
            }
        };

        if self.dedup.check_and_insert(packet.packet_id(), now) {
            self.stats.dedup_hits = self.stats.dedup_hits.saturating_add(1);
            return Ok(());
        }

        // The transmitter of a flood frame is its last path entry.
        if let Some(&relayer) = packet.path().last() {
            if relayer != our_hash {
                self.neighbours.record(relayer, rssi, snr4, now);
                self.drain_mailbox_for(relayer, now)?;
            }
        }

        // Addressed payloads carry the originator hash in byte 1. A peer
        // that only originates traffic (zero-hop login, empty-path flood)
        // is still a reappearance: refresh it and release its mail. The
        // link sample belongs to the transmitter, so the originator only
        // gets one when it transmitted the frame itself.
        if forward::is_addressed_type(packet.payload_type) && packet.payload().len() >= 2 {
            let src = packet.payload()[1];
            if src != our_hash {
                if packet.path().is_empty() {
                    self.neighbours.record(src, rssi, snr4, now);
                } else {
                    self.neighbours.touch(src, now);
                }
                self.drain_mailbox_for(src, now)?;
            }
        }

        if packet.payload_type == PayloadType::Advert {
            self.process_advert(&packet, rssi, snr4)?;
        }

        match forward::decide(&packet, our_hash, rssi) {
            ForwardDecision::Consume => self.consume(&packet, now)?,
            ForwardDecision::RelayFlood => self.relay_flood(packet, snr4, now),
            ForwardDecision::RelayDirect => self.relay_direct(packet, now),
            ForwardDecision::Drop(reason) => {
                trace!(?reason, "packet not relayed");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            }
        }
        Ok(())
    }

    fn process_advert(&mut self, packet: &Packet, rssi: i16, snr4: i16) -> Result<()> {
        let now = self.clock.uptime_ms();
        let advert = match Advert::parse(packet.payload()) {
            Ok(advert) => advert,
            Err(error) => {
                debug!(%error, "invalid advert dropped");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
                return Ok(());
            }
        };
        if advert.node_hash() == self.identity.node_hash() {
            return Ok(());
        }
        self.stats.adverts_seen = self.stats.adverts_seen.saturating_add(1);
        self.neighbours.record(advert.node_hash(), rssi, snr4, now);

        match self.timesync.observe(advert.timestamp, now) {
            Ok(SyncOutcome::Adopted) | Ok(SyncOutcome::Committed) => {
                // Tell the neighbourhood about the corrected clock shortly.
                self.pending_advert_ms = Some(now + POST_SYNC_ADVERT_DELAY_MS);
            }
            Ok(_) => {}
            Err(error) => debug!(%error, "advert timestamp rejected"),
        }

        let newly_named = self.neighbours.enrich_from_advert(&advert, now);
        if newly_named {
            let name = advert.name.as_deref().unwrap_or("?");
            info!(
                name,
                hash = format_args!("{:02x}", advert.node_hash()),
                "new node heard"
            );
            let message = format!("NEW {}: [{:02X}] {}dBm", name, advert.node_hash(), rssi);
            self.send_alert(&message, now)?;
        }

        self.drain_mailbox_for(advert.node_hash(), now)?;
        Ok(())
    }

    fn consume(&mut self, packet: &Packet, now: u64) -> Result<()> {
        match packet.payload_type {
            PayloadType::AnonRequest => self.handle_login(packet, now)?,
            PayloadType::Request | PayloadType::TextMessage => {
                self.handle_authenticated(packet, now)?;
            }
            _ => {
                trace!(payload_type = ?packet.payload_type, "addressed payload unhandled");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            }
        }
        Ok(())
    }

    // ===== Login and authenticated commands =====

    fn handle_login(&mut self, packet: &Packet, now: u64) -> Result<()> {
        if !self.limiter.allow(Category::Login, now) {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        }
        let request = match AnonLoginRequest::decode(packet.payload()) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "malformed login request");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
                return Ok(());
            }
        };
        let return_path: Vec<u8> = packet.path().iter().rev().copied().collect();
        let grant = match self.sessions.process_login(
            self.identity.keypair(),
            &request,
            &self.config,
            &return_path,
            now,
        ) {
            Ok(grant) => grant,
            Err(rejection) => {
                debug!(%rejection, "login refused");
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
                return Ok(());
            }
        };
        self.stats.logins = self.stats.logins.saturating_add(1);

        let timestamp = self.timesync.now(now).unwrap_or(grant.timestamp);
        let response = LoginResponse {
            timestamp,
            code: 0,
            keepalive_div4: 30,
            is_admin: grant.is_admin,
            permissions: grant.permissions,
            nonce: self.rng.gen(),
            firmware_version: FIRMWARE_VERSION,
        };
        let sealed = grant.keys.encrypt_then_mac(&response.encode())?;
        let payload = text::encode_addressed(grant.pubkey[0], self.identity.node_hash(), &sealed);
        let mut reply = Packet::new(RouteType::Direct, PayloadType::Response, payload)?;
        for &hop in &return_path {
            let _ = reply.push_path_hash(hop);
        }
        self.queue_tx(reply, 0, now);
        Ok(())
    }

    fn handle_authenticated(&mut self, packet: &Packet, now: u64) -> Result<()> {
        if !self.limiter.allow(Category::Request, now) {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        }
        let Ok((_dest, src_hash, sealed)) = text::parse_addressed(packet.payload()) else {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        };
        let Some(session) = self.sessions.by_hash(src_hash) else {
            debug!(src = format_args!("{:02x}", src_hash), "request without session");
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        };
        let keys = session.keys.clone();
        let Ok(plain) = keys.mac_then_decrypt(sealed) else {
            debug!("request failed authentication");
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        };
        let Ok((timestamp, _kind, _attempt, command)) = text::parse_text_plaintext(&plain) else {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        };
        let Some(session) = self.sessions.authorize(src_hash, timestamp, PERM_GUEST, now) else {
            debug!("request replayed or under-privileged");
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return Ok(());
        };
        let is_admin = session.has_permissions(PERM_ADMIN);
        let return_path = session.return_path.clone();

        let reply_text = self.execute_command(command.trim(), is_admin, now);
        let reply_timestamp = self.timesync.now(now).unwrap_or(timestamp);
        let plain = text::encode_text_plaintext(
            reply_timestamp,
            text::TXT_KIND_CLI_DATA,
            0,
            &reply_text,
        );
        let sealed = keys.encrypt_then_mac(&plain)?;
        let payload = text::encode_addressed(src_hash, self.identity.node_hash(), &sealed);
        let mut reply = Packet::new(RouteType::Direct, PayloadType::Response, payload)?;
        for &hop in &return_path {
            let _ = reply.push_path_hash(hop);
        }
        self.queue_tx(reply, 0, now);
        Ok(())
    }

    fn execute_command(&mut self, command: &str, is_admin: bool, now: u64) -> String {
        match command {
            "status" => format!(
                "synced:{} nodes:{} sessions:{} pwr:{}dBm quiet:{}",
                self.timesync.is_synced(),
                self.neighbours.len(),
                self.sessions.len(),
                self.tx_power_dbm,
                self.limiter.quiet_active(),
            ),
            "stats" => self.stats.report_line(),
            "nodes" => {
                let mut lines: Vec<String> = self
                    .neighbours
                    .iter()
                    .map(|n| {
                        format!(
                            "{:02X} {} {}dBm snr{}",
                            n.hash,
                            n.name.as_deref().unwrap_or("?"),
                            n.last_rssi,
                            n.ema_snr4 / 4,
                        )
                    })
                    .collect();
                if lines.is_empty() {
                    lines.push("no nodes heard".to_string());
                }
                lines.join("\n")
            }
            "advert" if is_admin => {
                self.pending_advert_ms = Some(now);
                "advert queued".to_string()
            }
            "reboot" if is_admin => {
                self.pending_reboot = true;
                "rebooting".to_string()
            }
            "advert" | "reboot" => "admin only".to_string(),
            _ => "unknown command".to_string(),
        }
    }

    // ===== Relaying =====

    fn relay_flood(&mut self, mut packet: Packet, snr4: i16, now: u64) {
        // Capture offline-destination texts before they fade from the mesh.
        if packet.payload_type == PayloadType::TextMessage && packet.payload().len() >= 2 {
            let dest = packet.payload()[0];
            let src = packet.payload()[1];
            if self.neighbours.is_offline(dest, now) {
                if let Some(secs) = self.timesync.now(now) {
                    let outcome = self.mailbox.store(dest, src, packet.payload().to_vec(), secs);
                    debug!(?outcome, dest = format_args!("{:02x}", dest), "mailbox capture");
                }
            }
        }

        if !self.limiter.allow(Category::Forward, now) {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return;
        }
        if packet.push_path_hash(self.identity.node_hash()).is_err() {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return;
        }
        let frame_len = packet.encode().len();
        let delay = forward::rx_delay_ms(snr4, frame_len);
        self.queue_tx(packet, delay, now);
        self.stats.packets_forwarded = self.stats.packets_forwarded.saturating_add(1);
    }

    fn relay_direct(&mut self, mut packet: Packet, now: u64) {
        packet.peel_path();
        // Gate on the link we are about to use: the next listed hop, or the
        // final destination when the path is now empty.
        let gate = packet
            .path()
            .first()
            .copied()
            .or_else(|| packet.payload().first().copied());
        if let Some(hash) = gate {
            if !self.neighbours.breaker_allows(hash, now) {
                debug!(
                    hash = format_args!("{:02x}", hash),
                    "direct relay suppressed by circuit breaker"
                );
                self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
                return;
            }
        }
        if !self.limiter.allow(Category::Forward, now) {
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
            return;
        }
        self.queue_tx(packet, 0, now);
        self.stats.packets_forwarded = self.stats.packets_forwarded.saturating_add(1);
    }

    fn queue_tx(&mut self, packet: Packet, base_delay_ms: u64, now: u64) {
        let frame = packet.encode();
        let jitter = forward::tx_jitter_ms(&mut self.rng, frame.len());
        if !self.txq.push(frame, now + base_delay_ms + jitter) {
            debug!("tx queue full, frame dropped");
            self.stats.packets_dropped = self.stats.packets_dropped.saturating_add(1);
        }
    }

    async fn pump_tx(&mut self) -> Result<()> {
        if self.tx_in_flight {
            return Ok(());
        }
        let now = self.clock.uptime_ms();
        let Some(entry) = self.txq.pop_due(now) else {
            return Ok(());
        };
        if self.radio.channel_busy().await {
            let slot = forward::slot_ms(entry.frame.len());
            trace!("channel busy, transmission deferred");
            self.txq.defer(entry, now + slot);
            return Ok(());
        }
        match self.radio.transmit(&entry.frame).await {
            Ok(()) => self.tx_in_flight = true,
            Err(fault) => {
                warn!(%fault, "transmit failed");
                self.handle_radio_error(RadioErrorKind::Tx).await?;
            }
        }
        Ok(())
    }

    // ===== Housekeeping =====

    async fn on_tick(&mut self) -> Result<()> {
        let now = self.clock.uptime_ms();
        self.timesync.tick(now);

        if self.pending_advert_ms.is_some_and(|due| now >= due) {
            self.pending_advert_ms = None;
            self.queue_self_advert(now)?;
        }
        if now >= self.next_advert_ms {
            self.next_advert_ms = now + self.config.advert_interval.as_millis() as u64;
            self.queue_self_advert(now)?;
        }

        let offline = self.neighbours.take_offline_transitions(now);
        for neighbour in offline {
            let name = neighbour.name.as_deref().unwrap_or("?").to_string();
            info!(
                name,
                hash = format_args!("{:02x}", neighbour.hash),
                "node went offline"
            );
            let message = format!("OFFLINE {} [{:02X}]", name, neighbour.hash);
            self.send_alert(&message, now)?;
        }

        if now.saturating_sub(self.last_minute_ms) >= MINUTE_MS {
            self.last_minute_ms = now;
            self.sessions.sweep_idle(now);
            if let Some(secs) = self.timesync.now(now) {
                self.mailbox.purge_expired(secs);
            }
            let hour = self.timesync.now(now).map(|s| ((s % 86_400) / 3_600) as u8);
            self.limiter.evaluate_quiet(hour);

            let target = forward::adjust_tx_power(
                self.tx_power_dbm,
                self.neighbours.avg_ema_snr4(now),
                &self.config.radio,
            );
            if target != self.tx_power_dbm {
                info!(from = self.tx_power_dbm, to = target, "tx power adjusted");
                self.tx_power_dbm = target;
                self.radio.set_tx_power(target).await?;
            }

            self.check_daily_report(now)?;
            self.flush_dirty().await?;
        }
        Ok(())
    }

    fn check_daily_report(&mut self, now: u64) -> Result<()> {
        if !self.config.report.enabled {
            return Ok(());
        }
        let Some(dest) = self.config.report.dest_pubkey else {
            return Ok(());
        };
        let Some(secs) = self.timesync.now(now) else {
            return Ok(());
        };
        let day = secs / 86_400;
        let hour = ((secs % 86_400) / 3_600) as u8;
        let minute = ((secs % 3_600) / 60) as u8;
        if hour == self.config.report.hour
            && minute == self.config.report.minute
            && self.last_report_day != Some(day)
        {
            self.last_report_day = Some(day);
            let message = self.stats.report_line();
            info!("daily report queued");
            self.send_encrypted_text(dest, &message, now)?;
        }
        Ok(())
    }

    fn send_alert(&mut self, message: &str, now: u64) -> Result<()> {
        if !self.config.alert.enabled {
            return Ok(());
        }
        let Some(dest) = self.config.alert.dest_pubkey else {
            return Ok(());
        };
        self.send_encrypted_text(dest, message, now)?;
        self.queue_chat_presented_advert(now)?;
        Ok(())
    }

    fn send_encrypted_text(&mut self, dest: [u8; 32], message: &str, now: u64) -> Result<()> {
        let Some(secs) = self.timesync.now(now) else {
            debug!("encrypted text suppressed while unsynced");
            return Ok(());
        };
        let key = match PublicKey::from_bytes(&dest) {
            Ok(key) => key,
            Err(error) => {
                warn!(%error, "configured destination key invalid");
                return Ok(());
            }
        };
        let keys = SessionKeys::agree(self.identity.keypair(), &key);
        let plain = text::encode_text_plaintext(secs, text::TXT_KIND_PLAIN, 0, message);
        let sealed = keys.encrypt_then_mac(&plain)?;
        let payload = text::encode_addressed(key.node_hash(), self.identity.node_hash(), &sealed);
        let packet = Packet::new(RouteType::Flood, PayloadType::TextMessage, payload)?;
        self.queue_tx(packet, 0, now);
        Ok(())
    }

    fn queue_self_advert(&mut self, now: u64) -> Result<()> {
        let timestamp = self.timesync.now(now).unwrap_or(0);
        let kind = self.presentation.current(self.identity.kind());
        let payload = Advert::build(&self.identity, timestamp, kind);
        let packet = Packet::new(RouteType::Flood, PayloadType::Advert, payload)?;
        self.queue_tx(packet, 0, now);
        Ok(())
    }

    /// Advert presenting the Chat kind so phone clients surface the
    /// repeater's alerts. The override cannot outlive this function.
    fn queue_chat_presented_advert(&mut self, now: u64) -> Result<()> {
        let Some(timestamp) = self.timesync.now(now) else {
            return Ok(());
        };
        let scope = self.presentation.scope(NodeKind::Chat);
        let kind = scope.kind(self.identity.kind());
        let payload = Advert::build(&self.identity, timestamp, kind);
        drop(scope);
        let packet = Packet::new(RouteType::Flood, PayloadType::Advert, payload)?;
        self.queue_tx(packet, 0, now);
        Ok(())
    }

    fn drain_mailbox_for(&mut self, hash: u8, now: u64) -> Result<()> {
        if self.mailbox.count_for(hash) == 0 {
            return Ok(());
        }
        let Some(secs) = self.timesync.now(now) else {
            return Ok(());
        };
        for entry in self.mailbox.drain_for(hash, secs) {
            if !self.limiter.allow(Category::Forward, now) {
                debug!("mailbox drain stopped by forward budget");
                break;
            }
            let mut packet =
                Packet::new(RouteType::Flood, PayloadType::TextMessage, entry.payload)?;
            let _ = packet.push_path_hash(self.identity.node_hash());
            self.queue_tx(packet, 0, now);
            self.stats.packets_forwarded = self.stats.packets_forwarded.saturating_add(1);
        }
        Ok(())
    }

    // ===== Fault handling =====

    async fn handle_radio_error(&mut self, kind: RadioErrorKind) -> Result<()> {
        self.stats.radio_errors = self.stats.radio_errors.saturating_add(1);
        self.consecutive_radio_errors += 1;
        self.cumulative_radio_errors += 1;
        debug!(
            ?kind,
            consecutive = self.consecutive_radio_errors,
            cumulative = self.cumulative_radio_errors,
            "radio error"
        );
        if self.consecutive_radio_errors >= MAX_CONSECUTIVE_RADIO_ERRORS {
            warn!("resetting radio after repeated errors");
            self.radio.reset().await?;
            self.radio.set_tx_power(self.tx_power_dbm).await?;
            self.consecutive_radio_errors = 0;
            self.tx_in_flight = false;
        }
        if self.cumulative_radio_errors >= REBOOT_RADIO_ERRORS {
            self.pending_reboot = true;
        }
        Ok(())
    }

    // ===== Commands =====

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SendAdvert => {
                let now = self.clock.uptime_ms();
                self.pending_advert_ms = Some(now);
            }
            EngineCommand::Status { reply } => {
                let now = self.clock.uptime_ms();
                let status = EngineStatus {
                    synced: self.timesync.is_synced(),
                    clock: self.timesync.now(now),
                    neighbours: self.neighbours.len(),
                    sessions: self.sessions.len(),
                    mailbox_entries: self.mailbox.len(),
                    tx_power_dbm: self.tx_power_dbm,
                    quiet_active: self.limiter.quiet_active(),
                    stats: self.stats,
                };
                let _ = reply.send(status);
            }
            EngineCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // ===== Persistence =====

    async fn load_persistent(&mut self) -> Result<()> {
        match self.storage.read_block(BlockId::Config).await? {
            Some(data) => match storage::decode_config(&data) {
                Ok(config) => {
                    info!("config block loaded");
                    self.config = config;
                }
                Err(error) => {
                    warn!(%error, "config block reinitialized");
                    let encoded = storage::encode_config(&self.config);
                    self.storage.write_block(BlockId::Config, &encoded).await?;
                }
            },
            None => {
                let encoded = storage::encode_config(&self.config);
                self.storage.write_block(BlockId::Config, &encoded).await?;
            }
        }
        // Quiet hours may have changed with the loaded config.
        self.limiter = RateLimiter::new(self.config.quiet_hours);
        self.tx_power_dbm = self.config.radio.max_tx_power_dbm;

        match self.storage.read_block(BlockId::Stats).await? {
            Some(data) => match storage::decode_stats(&data) {
                Ok(stats) => self.stats = stats,
                Err(error) => {
                    warn!(%error, "stats block reinitialized");
                    self.stats = LifetimeStats::default();
                    self.flush_stats().await?;
                }
            },
            None => self.flush_stats().await?,
        }

        match self.storage.read_block(BlockId::Mailbox).await? {
            Some(data) => match storage::decode_mailbox(&data) {
                Ok(entries) => self.mailbox.load_persisted(entries),
                Err(error) => {
                    warn!(%error, "mailbox block reinitialized");
                    let encoded = storage::encode_mailbox(&[]);
                    self.storage.write_block(BlockId::Mailbox, &encoded).await?;
                }
            },
            None => {}
        }
        Ok(())
    }

    async fn flush_stats(&mut self) -> Result<()> {
        let encoded = storage::encode_stats(&self.stats);
        self.storage.write_block(BlockId::Stats, &encoded).await?;
        Ok(())
    }

    async fn flush_dirty(&mut self) -> Result<()> {
        if self.mailbox.take_dirty() {
            let encoded = storage::encode_mailbox(self.mailbox.persisted_entries());
            self.storage.write_block(BlockId::Mailbox, &encoded).await?;
        }
        self.flush_stats().await
    }

    async fn flush_all(&mut self) -> Result<()> {
        let encoded = storage::encode_mailbox(self.mailbox.persisted_entries());
        self.storage.write_block(BlockId::Mailbox, &encoded).await?;
        self.mailbox.take_dirty();
        self.flush_stats().await
    }
}
