//! Sender context
//!
//! Owns the configured peers, the per-peer retransmit rings and pacers, and
//! the single event loop thread that multiplexes inbound control traffic,
//! keep-alives, retransmissions, and paced originals. The application talks
//! to the loop through bounded channels: `data_write` feeds the ingress
//! queue and returns `WouldBlock` once the pacer has backed it up.

use crate::block::{DataBlock, OobBlock};
use crate::config::{ContextConfig, PeerConfig, Profile, DEFAULT_MAX_RETRIES, DEFAULT_MTU};
use crate::error::{Error, Result};
use crate::handler::{ConnectRequest, Handlers, StatsSnapshot};
use crate::oob::OobQueue;
use crate::transform::{RxTransform, TxTransform};
use crate::{caps, OOB_NOT_SUPPORTED};
use bytes::Bytes;
use crossbeam_channel::{bounded, never, select, Receiver as ChanReceiver, Sender as ChanSender};
use parking_lot::Mutex;
use rist_crypto::psk::{KeySize, PskEncryptor};
use rist_io::{NtpTime, RateLimiter, RistSocket, Timer};
use rist_protocol::retransmit::{ring_capacity, RetransmitQueue};
use rist_protocol::{
    DataPacket, KeepAlivePacket, OobPacket, Packet, PacketMeta, Peer, PeerEvent, PeerId, PeerState,
    RetransmitOutcome, SenderPeerStats, SenderStats, Seq,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Retransmissions queued ahead of originals, per peer
const RETX_QUEUE_DEPTH: usize = 512;

/// Datagrams drained per peer per loop iteration
const RECV_BATCH: usize = 64;

enum Command {
    AddPeer(PeerId, PeerConfig),
    RemovePeer(PeerId),
    OobWrite(OobBlock),
    Shutdown,
}

/// Everything configured before `start` consumes it
struct PrepState {
    cfg: ContextConfig,
    peers: Vec<(PeerId, PeerConfig)>,
    secret: Option<(Vec<u8>, KeySize)>,
    compression: bool,
    handlers: Handlers,
}

struct Runtime {
    cmd_tx: ChanSender<Command>,
    ingress_tx: ChanSender<DataBlock>,
    handle: Option<JoinHandle<()>>,
}

/// RIST sender context
pub struct Sender {
    flow_id: u32,
    prep: Mutex<Option<PrepState>>,
    runtime: Mutex<Option<Runtime>>,
    next_peer_id: AtomicU64,
    oob_queue: Arc<OobQueue>,
    stats: Arc<Mutex<SenderStats>>,
}

impl Sender {
    /// Create a sender for one flow. A `flow_id` of zero asks the library to
    /// assign one; explicit flow ids must be even (odd values are reserved).
    pub fn new(profile: Profile, flow_id: u32) -> Result<Self> {
        let flow_id = match flow_id {
            0 => loop {
                let id: u32 = rand::random::<u32>() & !1;
                if id != 0 {
                    break id;
                }
            },
            id if id & 1 == 1 => {
                return Err(Error::InvalidConfig("flow_id must be even".into()));
            }
            id => id,
        };

        Ok(Sender {
            flow_id,
            prep: Mutex::new(Some(PrepState {
                cfg: ContextConfig::new(profile),
                peers: Vec::new(),
                secret: None,
                compression: false,
                handlers: Handlers::default(),
            })),
            runtime: Mutex::new(None),
            next_peer_id: AtomicU64::new(1),
            oob_queue: Arc::new(OobQueue::default()),
            stats: Arc::new(Mutex::new(SenderStats::default())),
        })
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    fn with_prep<T>(&self, f: impl FnOnce(&mut PrepState) -> Result<T>) -> Result<T> {
        let mut prep = self.prep.lock();
        match prep.as_mut() {
            Some(state) => f(state),
            None => Err(Error::AlreadyStarted),
        }
    }

    /// Override the auto-generated cname
    pub fn cname_set(&self, cname: &str) -> Result<()> {
        if cname.len() > rist_protocol::packet::MAX_CNAME {
            return Err(Error::InvalidConfig("cname exceeds 128 bytes".into()));
        }
        self.with_prep(|p| {
            p.cfg.cname = cname.to_string();
            Ok(())
        })
    }

    /// Install the authentication handlers
    pub fn auth_handler_set(
        &self,
        connect: Option<crate::handler::ConnectCallback>,
        disconnect: Option<crate::handler::DisconnectCallback>,
    ) -> Result<()> {
        self.with_prep(|p| {
            p.handlers.connect = connect;
            p.handlers.disconnect = disconnect;
            Ok(())
        })
    }

    /// Install the OOB callback (delivery bypasses the pull queue)
    pub fn oob_callback_set(&self, cb: crate::handler::OobCallback) -> Result<()> {
        self.with_prep(|p| {
            if !p.cfg.profile.supports_aux() {
                return Err(Error::InvalidConfig(OOB_NOT_SUPPORTED.into()));
            }
            p.handlers.oob = Some(cb);
            Ok(())
        })
    }

    pub fn stats_callback_set(&self, cb: crate::handler::StatsCallback) -> Result<()> {
        self.with_prep(|p| {
            p.handlers.stats = Some(cb);
            Ok(())
        })
    }

    /// Enable pre-shared-key encryption
    pub fn encrypt_aes_set(&self, secret: &str, key_size: u32) -> Result<()> {
        let size = KeySize::from_bits(key_size)
            .ok_or_else(|| Error::InvalidConfig("key_size must be 128 or 256".into()))?;
        if secret.is_empty() || secret.len() > rist_crypto::MAX_SECRET {
            return Err(Error::InvalidConfig("secret must be 1..=128 bytes".into()));
        }
        self.with_prep(|p| {
            if !p.cfg.profile.supports_aux() {
                return Err(Error::InvalidConfig(
                    "encryption requires the main profile".into(),
                ));
            }
            p.secret = Some((secret.as_bytes().to_vec(), size));
            Ok(())
        })
    }

    /// Enable LZ4 compression (0 disables, 1..=10 enables)
    pub fn compression_set(&self, level: u8) -> Result<()> {
        if level > 10 {
            return Err(Error::InvalidConfig("compression level is 0..=10".into()));
        }
        self.with_prep(|p| {
            if level > 0 && !p.cfg.profile.supports_aux() {
                return Err(Error::InvalidConfig(
                    "compression requires the main profile".into(),
                ));
            }
            p.compression = level > 0;
            Ok(())
        })
    }

    pub fn session_timeout_set(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidConfig("session timeout must be non-zero".into()));
        }
        self.with_prep(|p| {
            p.cfg.session_timeout = timeout;
            Ok(())
        })
    }

    pub fn keepalive_timeout_set(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "keepalive timeout must be non-zero".into(),
            ));
        }
        self.with_prep(|p| {
            p.cfg.keepalive_timeout = timeout;
            Ok(())
        })
    }

    pub fn jitter_max_set(&self, jitter: Duration) -> Result<()> {
        self.with_prep(|p| {
            p.cfg.max_jitter = jitter.clamp(Duration::from_millis(1), Duration::from_millis(100));
            Ok(())
        })
    }

    pub fn stats_interval_set(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig("stats interval must be non-zero".into()));
        }
        self.with_prep(|p| {
            p.cfg.stats_interval = interval;
            Ok(())
        })
    }

    /// Add a peer; the flow is transmitted to every authenticated peer
    pub fn peer_add(&self, config: &PeerConfig) -> Result<PeerId> {
        config.validate()?;
        let id = PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed));

        if let Some(runtime) = self.runtime.lock().as_ref() {
            runtime
                .cmd_tx
                .send(Command::AddPeer(id, config.clone()))
                .map_err(|_| Error::NotStarted)?;
            return Ok(id);
        }

        self.with_prep(|p| {
            p.peers.push((id, config.clone()));
            Ok(id)
        })
    }

    pub fn peer_remove(&self, peer: PeerId) -> Result<()> {
        if let Some(runtime) = self.runtime.lock().as_ref() {
            runtime
                .cmd_tx
                .send(Command::RemovePeer(peer))
                .map_err(|_| Error::NotStarted)?;
            return Ok(());
        }
        self.with_prep(|p| {
            if p.peers.iter().any(|(id, _)| *id == peer) {
                p.peers.retain(|(id, _)| *id != peer);
                Ok(())
            } else {
                Err(Error::PeerDead)
            }
        })
    }

    /// Kick off the event loop thread
    pub fn start(&self) -> Result<()> {
        let mut guard = self.prep.lock();
        // Validate before consuming so a rejected start leaves no trace.
        guard.as_ref().ok_or(Error::AlreadyStarted)?.cfg.validate()?;
        let prep = guard.take().expect("checked above");
        drop(guard);

        let (cmd_tx, cmd_rx) = bounded(64);
        let (ingress_tx, ingress_rx) = bounded(prep.cfg.queue_depth);

        let core = SenderCore::build(
            prep,
            self.flow_id,
            cmd_rx,
            ingress_rx,
            self.oob_queue.clone(),
            self.stats.clone(),
        )?;

        let handle = std::thread::Builder::new()
            .name("rist-sender".into())
            .spawn(move || core.run())
            .map_err(|e| Error::Fatal(e.to_string()))?;

        *self.runtime.lock() = Some(Runtime {
            cmd_tx,
            ingress_tx,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Submit one data block for transmission
    ///
    /// Returns the number of payload bytes accepted, or `WouldBlock` when
    /// the pacer has the ingress queue backed up.
    pub fn data_write(&self, block: DataBlock) -> Result<usize> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(Error::NotStarted)?;
        let len = block.payload.len();
        runtime
            .ingress_tx
            .try_send(block)
            .map_err(|e| match e {
                crossbeam_channel::TrySendError::Full(_) => Error::WouldBlock,
                crossbeam_channel::TrySendError::Disconnected(_) => Error::NotStarted,
            })?;
        Ok(len)
    }

    /// Send an out-of-band block to one peer (or every established peer)
    pub fn oob_write(&self, block: OobBlock) -> Result<usize> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(Error::NotStarted)?;
        let len = block.payload.len();
        runtime
            .cmd_tx
            .try_send(Command::OobWrite(block))
            .map_err(|_| Error::WouldBlock)?;
        Ok(len)
    }

    /// Read an inbound OOB block from the pull queue
    pub fn oob_read(&self) -> Option<OobBlock> {
        self.oob_queue.pop()
    }

    /// Most recent stats snapshot
    pub fn stats(&self) -> SenderStats {
        self.stats.lock().clone()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if let Some(mut runtime) = self.runtime.lock().take() {
            let _ = runtime.cmd_tx.send(Command::Shutdown);
            if let Some(handle) = runtime.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// One configured peer inside the loop
struct PeerRuntime {
    id: PeerId,
    config: PeerConfig,
    socket: RistSocket,
    local: SocketAddr,
    remote: SocketAddr,
    proto: Peer,
    retx: RetransmitQueue,
    pending_retx: VecDeque<Bytes>,
    pacer: RateLimiter,
    sent: u64,
    sent_bytes: u64,
    bloat_dropped: u64,
    reported_received: u64,
    reported_lost: u64,
    disconnect_fired: bool,
}

impl PeerRuntime {
    fn build(id: PeerId, config: PeerConfig, cfg: &ContextConfig, now: Instant) -> Result<Self> {
        let socket = RistSocket::bind_for(config.address)?;
        let local = socket.local_addr()?;

        let capacity = ring_capacity(
            config.recovery_window_ms(config.recovery_length_max),
            config.recovery_maxbitrate,
            DEFAULT_MTU,
        )
        .min(1 << 17);
        let retx = RetransmitQueue::new(capacity, DEFAULT_MAX_RETRIES, config.recovery_max())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        // Bucket depth of roughly 10 ms at the peak rate, never below 2 MTU.
        let burst = (config.recovery_maxbitrate as u64 / 800).max(2 * DEFAULT_MTU as u64);
        let pacer = RateLimiter::new(config.recovery_maxbitrate as u64, burst);

        let proto = Peer::new(
            config.rtt_min(),
            config.rtt_max(),
            rist_protocol::BufferBloat::new(
                config.buffer_bloat_mode,
                config.bloat_limit(),
                config.bloat_hard_limit(),
            ),
            cfg.keepalive_timeout,
            cfg.session_timeout,
            config.weight,
            now,
        );

        let remote = config.address;
        Ok(PeerRuntime {
            id,
            config,
            socket,
            local,
            remote,
            proto,
            retx,
            pending_retx: VecDeque::new(),
            pacer,
            sent: 0,
            sent_bytes: 0,
            bloat_dropped: 0,
            reported_received: 0,
            reported_lost: 0,
            disconnect_fired: false,
        })
    }

    fn snapshot(&self) -> SenderPeerStats {
        let counters = self.retx.counters();
        SenderPeerStats {
            peer_id: self.id.0,
            sent: self.sent,
            sent_bytes: self.sent_bytes,
            retransmitted: counters.retransmitted,
            suppressed: counters.suppressed,
            evicted: counters.evicted,
            bloat_dropped: self.bloat_dropped,
            rtt: self.proto.rtt().smoothed(),
            reported_received: self.reported_received,
            reported_lost: self.reported_lost,
        }
    }
}

struct SenderCore {
    cfg: ContextConfig,
    flow_id: u32,
    next_seq: Seq,
    peers: Vec<PeerRuntime>,
    handlers: Handlers,
    tx: TxTransform,
    rx: RxTransform,
    oob_queue: Arc<OobQueue>,
    stats_shared: Arc<Mutex<SenderStats>>,
    cmd_rx: ChanReceiver<Command>,
    ingress_rx: ChanReceiver<DataBlock>,
    staged: Option<DataBlock>,
    stats_timer: Timer,
    malformed: u64,
}

impl SenderCore {
    fn build(
        prep: PrepState,
        flow_id: u32,
        cmd_rx: ChanReceiver<Command>,
        ingress_rx: ChanReceiver<DataBlock>,
        oob_queue: Arc<OobQueue>,
        stats_shared: Arc<Mutex<SenderStats>>,
    ) -> Result<SenderCore> {
        let now = Instant::now();

        let encryptor = match &prep.secret {
            Some((secret, size)) => Some(
                PskEncryptor::new(secret, *size).map_err(|e| Error::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };
        let rx = RxTransform::new(
            prep.secret
                .as_ref()
                .map(|(secret, size)| (secret.as_slice(), *size)),
        )
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let mut core = SenderCore {
            stats_timer: Timer::new(prep.cfg.stats_interval),
            tx: TxTransform::new(prep.compression, encryptor),
            rx,
            cfg: prep.cfg,
            flow_id,
            next_seq: Seq::new(0),
            peers: Vec::new(),
            handlers: prep.handlers,
            oob_queue,
            stats_shared,
            cmd_rx,
            ingress_rx,
            staged: None,
            malformed: 0,
        };

        for (id, config) in prep.peers {
            let peer = core.spawn_peer(id, config, now)?;
            core.peers.push(peer);
        }
        Ok(core)
    }

    fn spawn_peer(&self, id: PeerId, config: PeerConfig, now: Instant) -> Result<PeerRuntime> {
        let mut peer = PeerRuntime::build(id, config, &self.cfg, now)?;

        // Simple profile has no keep-alive exchange; the auth decision is
        // taken at creation. With no handler installed, main profile peers
        // are implicitly accepted as well.
        if !self.cfg.profile.supports_aux() || self.handlers.connect.is_none() {
            peer.proto.touch(now);
            let accepted = self.handlers.authorize(&ConnectRequest {
                remote: peer.remote,
                local: peer.local,
                peer: id,
                cname: String::new(),
            });
            peer.proto.set_auth_result(accepted);
            if !accepted {
                tracing::warn!(peer = id.0, "peer declined by connect handler");
            }
        }
        tracing::info!(peer = id.0, remote = %peer.remote, "sender peer created");
        Ok(peer)
    }

    fn capabilities(&self) -> u32 {
        let mut bits = caps::RETRANSMIT | caps::OOB;
        if self.tx.encrypting() {
            bits |= caps::ENCRYPTION;
        }
        bits
    }

    fn run(mut self) {
        loop {
            let now = Instant::now();
            self.drain_sockets(now);
            self.service_peers(now);
            self.pump_retransmits(now);
            self.pump_originals(now);
            self.publish_stats();
            self.reap_dead();

            let timeout = self.sleep_budget(Instant::now());
            let cmd_rx = self.cmd_rx.clone();
            let ingress = if self.staged.is_none() {
                self.ingress_rx.clone()
            } else {
                never()
            };

            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(ingress) -> block => {
                    if let Ok(block) = block {
                        self.staged = Some(block);
                    }
                }
                default(timeout) => {}
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::AddPeer(id, config) => match self.spawn_peer(id, config, now) {
                Ok(peer) => self.peers.push(peer),
                Err(e) => tracing::error!(peer = id.0, error = %e, "failed to add peer"),
            },
            Command::RemovePeer(id) => {
                for peer in &mut self.peers {
                    if peer.id == id {
                        peer.proto.mark_removed();
                        fire_disconnect(peer, &self.handlers);
                    }
                }
            }
            Command::OobWrite(block) => self.send_oob(block, now),
            Command::Shutdown => unreachable!("handled by the select arm"),
        }
    }

    fn send_oob(&mut self, block: OobBlock, now: Instant) {
        if !self.cfg.profile.supports_aux() {
            tracing::debug!("oob block dropped: simple profile");
            return;
        }
        let ntp = if block.ts_ntp.as_raw() == 0 {
            NtpTime::now()
        } else {
            block.ts_ntp
        };
        let out = self
            .tx
            .apply(block.payload.clone(), self.flow_id, ntp.as_raw() as u32);

        for peer in self
            .peers
            .iter_mut()
            .filter(|p| p.proto.is_established())
            .filter(|p| block.peer.map_or(true, |id| id == p.id))
        {
            let packet = OobPacket {
                meta: PacketMeta {
                    virt_src_port: 0,
                    virt_dst_port: peer.config.gre_dst_port,
                    flow_id: self.flow_id,
                    compressed: out.compressed,
                    salt: out.salt,
                },
                ntp: ntp.as_raw(),
                payload: out.payload.clone(),
            };
            let wire = packet.to_bytes();
            if peer.pacer.consume(wire.len(), now) {
                log_send(peer.socket.send_to(&wire, peer.remote), "oob");
            }
        }
    }

    fn drain_sockets(&mut self, now: Instant) {
        let mut buf = [0u8; 2048];
        for idx in 0..self.peers.len() {
            for _ in 0..RECV_BATCH {
                let peer = &mut self.peers[idx];
                match peer.socket.try_recv_from(&mut buf) {
                    Ok(Some((len, from))) => {
                        if from != peer.remote {
                            tracing::debug!(peer = peer.id.0, %from, "datagram from unexpected source");
                            continue;
                        }
                        let bytes = buf[..len].to_vec();
                        self.handle_inbound(idx, &bytes, now);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(peer = peer.id.0, error = %e, "socket receive error");
                        break;
                    }
                }
            }
        }
    }

    fn handle_inbound(&mut self, idx: usize, bytes: &[u8], now: Instant) {
        let packet = match Packet::from_bytes(bytes) {
            Ok(p) => p,
            Err(e) => {
                self.malformed += 1;
                tracing::debug!(error = %e, "malformed packet");
                return;
            }
        };

        match packet {
            Packet::NackRange(nack) => {
                self.peers[idx].proto.touch(now);
                let newest = self.peers[idx].retx.newest_seq().unwrap_or(Seq::new(0));
                for entry in nack.entries {
                    let base = Seq::extend_from_rtp(entry.base, newest);
                    for offset in 0..=entry.count as u32 {
                        self.service_nack(idx, base + offset, now);
                    }
                }
            }
            Packet::NackBitmask(nack) => {
                self.peers[idx].proto.touch(now);
                let seqs: Vec<Seq> = nack.sequences().collect();
                for seq in seqs {
                    self.service_nack(idx, seq, now);
                }
            }
            Packet::ReceiverReport(rr) => {
                let peer = &mut self.peers[idx];
                peer.proto.on_traffic(now);
                peer.reported_received = rr.report.received as u64;
                peer.reported_lost = rr.report.lost as u64;
                if let Some(rtt) = rtt_from_report(rr.report.lsr, rr.report.dlsr) {
                    peer.proto.rtt_sample(rtt, now);
                }
            }
            Packet::KeepAlive(ka) => {
                let peer = &mut self.peers[idx];
                peer.proto.on_keepalive(&ka.cname, ka.capabilities, now);
                if peer.proto.state() == PeerState::Handshaking && peer.proto.handshake_complete() {
                    let request = ConnectRequest {
                        remote: peer.remote,
                        local: peer.local,
                        peer: peer.id,
                        cname: ka.cname.clone(),
                    };
                    let accepted = self.handlers.authorize(&request);
                    let peer = &mut self.peers[idx];
                    peer.proto.set_auth_result(accepted);
                    if accepted {
                        tracing::info!(peer = peer.id.0, cname = %ka.cname, "peer authenticated");
                    } else {
                        tracing::warn!(peer = peer.id.0, "peer rejected by connect handler");
                        fire_disconnect(peer, &self.handlers);
                    }
                }
            }
            Packet::Oob(oob) => {
                let peer = &mut self.peers[idx];
                peer.proto.touch(now);
                let seq_word = oob.ntp as u32;
                match self.rx.restore(
                    oob.meta.salt.as_ref(),
                    oob.meta.compressed,
                    oob.payload,
                    oob.meta.flow_id,
                    seq_word,
                ) {
                    Ok(payload) => {
                        let block = OobBlock {
                            peer: Some(self.peers[idx].id),
                            payload,
                            ts_ntp: NtpTime::from_raw(oob.ntp),
                        };
                        match &self.handlers.oob {
                            Some(cb) => cb(block),
                            None => {
                                self.oob_queue.push(block);
                            }
                        }
                    }
                    Err(_) => {
                        let peer = &mut self.peers[idx];
                        if peer.proto.on_decrypt_failure(now) {
                            fire_disconnect(peer, &self.handlers);
                        }
                        tracing::debug!(peer = self.peers[idx].id.0, "oob decrypt failed");
                    }
                }
            }
            Packet::Data(_) => {
                tracing::debug!("data packet arrived at sender; ignored");
            }
        }
    }

    fn service_nack(&mut self, idx: usize, seq: Seq, now: Instant) {
        let peer = &mut self.peers[idx];
        if !peer.proto.is_established() {
            return;
        }
        if !peer.proto.bloat().allow_retransmit() {
            peer.bloat_dropped += 1;
            return;
        }

        let rtt = peer.proto.rtt().smoothed();
        match peer.retx.request(seq, now, rtt) {
            RetransmitOutcome::Send(wire) => {
                if peer.pending_retx.len() < RETX_QUEUE_DEPTH {
                    peer.pending_retx.push_back(wire);
                } else {
                    tracing::debug!(peer = peer.id.0, %seq, "retransmit queue full");
                }
            }
            RetransmitOutcome::Suppressed => {}
            outcome => {
                tracing::debug!(peer = peer.id.0, %seq, ?outcome, "retransmit unavailable");
            }
        }
    }

    /// Retransmissions drain ahead of originals, from the same bucket
    fn pump_retransmits(&mut self, now: Instant) {
        for peer in &mut self.peers {
            while let Some(wire) = peer.pending_retx.front() {
                if !peer.pacer.consume(wire.len(), now) {
                    break;
                }
                let wire = peer.pending_retx.pop_front().expect("front checked");
                peer.sent += 1;
                peer.sent_bytes += wire.len() as u64;
                log_send(peer.socket.send_to(&wire, peer.remote), "retransmit");
            }
        }
    }

    fn pump_originals(&mut self, now: Instant) {
        loop {
            if self.staged.is_none() {
                match self.ingress_rx.try_recv() {
                    Ok(block) => self.staged = Some(block),
                    Err(_) => break,
                }
            }

            // A block goes out to every established peer in the same pass;
            // wait until each bucket can take it so rings stay aligned.
            let est = {
                let block = self.staged.as_ref().expect("staged above");
                block.payload.len() + rist_protocol::packet::ENVELOPE_SIZE + 32
            };
            let ready = self
                .peers
                .iter_mut()
                .filter(|p| p.proto.is_established())
                .all(|p| p.pacer.check(est, now));
            if !ready {
                break;
            }

            let block = self.staged.take().expect("staged above");
            self.transmit_block(block, now);
        }
    }

    fn transmit_block(&mut self, block: DataBlock, now: Instant) {
        let seq = self.next_seq;
        self.next_seq.increment();

        let ntp = if block.ts_ntp.as_raw() == 0 {
            NtpTime::now()
        } else {
            block.ts_ntp
        };
        let out = self.tx.apply(block.payload, self.flow_id, seq.as_raw());
        let simple = !self.cfg.profile.supports_aux();

        for peer in self.peers.iter_mut().filter(|p| p.proto.is_established()) {
            let meta = PacketMeta {
                virt_src_port: block.virt_src_port,
                virt_dst_port: if block.virt_dst_port != 0 {
                    block.virt_dst_port
                } else {
                    peer.config.gre_dst_port
                },
                flow_id: self.flow_id,
                compressed: out.compressed,
                salt: out.salt,
            };
            let packet = DataPacket::new(meta, seq, ntp.as_raw(), out.payload.clone());
            let wire: Bytes = if simple {
                packet.to_rtp_bytes().freeze()
            } else {
                packet.to_bytes().freeze()
            };

            if let Some(evicted) = peer.retx.store(seq, wire.clone(), now) {
                tracing::debug!(peer = peer.id.0, %evicted, "retransmit ring wrapped");
            }

            if !peer.proto.bloat().allow_original(now) {
                peer.bloat_dropped += 1;
                continue;
            }
            if peer.pacer.consume(wire.len(), now) {
                peer.sent += 1;
                peer.sent_bytes += wire.len() as u64;
                log_send(peer.socket.send_to(&wire, peer.remote), "data");
            }
        }
    }

    fn service_peers(&mut self, now: Instant) {
        let simple = !self.cfg.profile.supports_aux();
        let capabilities = self.capabilities();
        let cname = self.cfg.cname.clone();
        let flow_id = self.flow_id;

        for peer in &mut self.peers {
            for event in peer.proto.poll(now) {
                match event {
                    PeerEvent::SendKeepAlive if !simple => {
                        let packet = KeepAlivePacket {
                            meta: PacketMeta {
                                virt_src_port: 0,
                                virt_dst_port: peer.config.gre_dst_port,
                                flow_id,
                                compressed: false,
                                salt: None,
                            },
                            capabilities,
                            cname: cname.clone(),
                        };
                        match packet.to_bytes() {
                            Ok(wire) => log_send(peer.socket.send_to(&wire, peer.remote), "keepalive"),
                            Err(e) => tracing::error!(error = %e, "keepalive encode failed"),
                        }
                    }
                    PeerEvent::SendKeepAlive => {}
                    PeerEvent::Died(reason) => {
                        tracing::warn!(peer = peer.id.0, ?reason, "peer died");
                        fire_disconnect(peer, &self.handlers);
                    }
                }
            }
        }
    }

    fn reap_dead(&mut self) {
        self.peers
            .retain(|p| !(p.proto.is_dead() && p.disconnect_fired));
    }

    fn publish_stats(&mut self) {
        if !self.stats_timer.try_fire() {
            return;
        }
        let snapshot = SenderStats {
            flow_id: self.flow_id,
            peers: self.peers.iter().map(|p| p.snapshot()).collect(),
        };
        *self.stats_shared.lock() = snapshot.clone();
        if let Some(cb) = &self.handlers.stats {
            cb(&StatsSnapshot::Sender(snapshot));
        }
    }

    fn sleep_budget(&mut self, now: Instant) -> Duration {
        let mut deadline = now + self.cfg.max_jitter;

        for peer in &self.peers {
            if !peer.proto.is_dead() {
                deadline = deadline.min(peer.proto.next_deadline());
            }
        }
        if self.staged.is_some()
            || self.peers.iter().any(|p| !p.pending_retx.is_empty())
        {
            deadline = deadline.min(now + Duration::from_millis(1));
        }

        deadline
            .saturating_duration_since(now)
            .max(Duration::from_micros(200))
    }

    fn shutdown(&mut self) {
        // Drain in-flight retransmissions, then disconnect every live peer.
        let now = Instant::now();
        self.pump_retransmits(now);
        for peer in &mut self.peers {
            if !peer.proto.is_dead() {
                peer.proto.mark_removed();
            }
            fire_disconnect(peer, &self.handlers);
        }
        tracing::info!(malformed = self.malformed, "sender context destroyed");
    }
}

fn fire_disconnect(peer: &mut PeerRuntime, handlers: &Handlers) {
    if !peer.disconnect_fired {
        peer.disconnect_fired = true;
        handlers.on_disconnect(peer.id);
    }
}

fn log_send(result: std::result::Result<usize, rist_io::SocketError>, kind: &str) {
    if let Err(e) = result {
        if !e.is_would_block() {
            tracing::debug!(kind, error = %e, "send failed");
        }
    }
}

/// RTT from a receiver report: `now_middle - lsr - dlsr`, 1/65536 s units
fn rtt_from_report(lsr: u32, dlsr: u32) -> Option<Duration> {
    if lsr == 0 {
        return None;
    }
    let now_middle = NtpTime::now().middle();
    let units = now_middle.wrapping_sub(lsr).wrapping_sub(dlsr);
    // Discard nonsense produced by clock skew (over a minute).
    if units > 60 * 65_536 {
        return None;
    }
    Some(Duration::from_secs_f64(units as f64 / 65_536.0))
}
