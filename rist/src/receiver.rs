//! Receiver context
//!
//! Owns the listening sockets, the lazily created flows with their reorder
//! buffers and NACK schedulers, and the event loop thread that drains
//! datagrams, releases packets on their deadlines, emits NACKs and receiver
//! reports, and sweeps dead peers. Delivery is either a synchronous data
//! callback or the bounded pull queue behind `data_read`.

use crate::block::{DataBlock, OobBlock};
use crate::config::{ContextConfig, PeerConfig, Profile, DEFAULT_MAX_RETRIES, DEFAULT_MTU};
use crate::error::{Error, Result};
use crate::handler::{ConnectRequest, Handlers, StatsSnapshot};
use crate::oob::OobQueue;
use crate::transform::{RxError, RxTransform, TxTransform};
use crate::OOB_NOT_SUPPORTED;
use crossbeam_channel::{bounded, select, Receiver as ChanReceiver, Sender as ChanSender};
use parking_lot::Mutex;
use rist_crypto::psk::{KeySize, PskEncryptor};
use rist_io::{NtpTime, RateLimiter, RistSocket, Timer};
use rist_protocol::retransmit::ring_capacity;
use rist_protocol::{
    DataPacket, Flow, FlowStats, KeepAlivePacket, NackType, OobPacket, Packet, PacketMeta, Peer,
    PeerEvent, PeerId, PeerState, ReceiverReport, ReceiverReportPacket, ReceiverStats, Seq,
    WireKind,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Datagrams drained per listener per loop iteration
const RECV_BATCH: usize = 64;

/// Receiver report cadence
const RR_INTERVAL: Duration = Duration::from_millis(1000);

enum Command {
    AddPeer(PeerId, PeerConfig),
    RemovePeer(PeerId),
    OobWrite(OobBlock),
    Shutdown,
}

struct PrepState {
    cfg: ContextConfig,
    peers: Vec<(PeerId, PeerConfig)>,
    secret: Option<(Vec<u8>, KeySize)>,
    nack_type: NackType,
    handlers: Handlers,
}

struct Runtime {
    cmd_tx: ChanSender<Command>,
    egress_rx: ChanReceiver<DataBlock>,
    handle: Option<JoinHandle<()>>,
}

/// RIST receiver context
pub struct Receiver {
    prep: Mutex<Option<PrepState>>,
    runtime: Mutex<Option<Runtime>>,
    next_peer_id: AtomicU64,
    oob_queue: Arc<OobQueue>,
    stats: Arc<Mutex<ReceiverStats>>,
}

impl Receiver {
    pub fn new(profile: Profile) -> Result<Self> {
        Ok(Receiver {
            prep: Mutex::new(Some(PrepState {
                cfg: ContextConfig::new(profile),
                peers: Vec::new(),
                secret: None,
                nack_type: NackType::Range,
                handlers: Handlers::default(),
            })),
            runtime: Mutex::new(None),
            next_peer_id: AtomicU64::new(1),
            oob_queue: Arc::new(OobQueue::default()),
            stats: Arc::new(Mutex::new(ReceiverStats::default())),
        })
    }

    fn with_prep<T>(&self, f: impl FnOnce(&mut PrepState) -> Result<T>) -> Result<T> {
        let mut prep = self.prep.lock();
        match prep.as_mut() {
            Some(state) => f(state),
            None => Err(Error::AlreadyStarted),
        }
    }

    pub fn cname_set(&self, cname: &str) -> Result<()> {
        if cname.len() > rist_protocol::packet::MAX_CNAME {
            return Err(Error::InvalidConfig("cname exceeds 128 bytes".into()));
        }
        self.with_prep(|p| {
            p.cfg.cname = cname.to_string();
            Ok(())
        })
    }

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

    /// Install the synchronous data callback; absent, blocks queue for
    /// [`Receiver::data_read`]
    pub fn data_callback_set(&self, cb: crate::handler::DataCallback) -> Result<()> {
        self.with_prep(|p| {
            p.handlers.data = Some(cb);
            Ok(())
        })
    }

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

    /// Choose the NACK encoding (range is the default)
    pub fn nack_type_set(&self, nack_type: NackType) -> Result<()> {
        self.with_prep(|p| {
            p.nack_type = nack_type;
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

    /// Add a listening peer endpoint; `config.address` is the local bind
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

    /// Start the receive loop thread
    pub fn start(&self) -> Result<()> {
        let mut guard = self.prep.lock();
        guard.as_ref().ok_or(Error::AlreadyStarted)?.cfg.validate()?;
        let prep = guard.take().expect("checked above");
        drop(guard);

        let (cmd_tx, cmd_rx) = bounded(64);
        let (egress_tx, egress_rx) = bounded(prep.cfg.queue_depth);

        let core = ReceiverCore::build(
            prep,
            cmd_rx,
            egress_tx,
            self.oob_queue.clone(),
            self.stats.clone(),
        )?;

        let handle = std::thread::Builder::new()
            .name("rist-receiver".into())
            .spawn(move || core.run())
            .map_err(|e| Error::Fatal(e.to_string()))?;

        *self.runtime.lock() = Some(Runtime {
            cmd_tx,
            egress_rx,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Block up to `timeout` for the next in-order data block
    pub fn data_read(&self, timeout: Duration) -> Result<DataBlock> {
        let egress_rx = {
            let runtime = self.runtime.lock();
            runtime
                .as_ref()
                .ok_or(Error::NotStarted)?
                .egress_rx
                .clone()
        };
        egress_rx.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => Error::TimedOut,
            crossbeam_channel::RecvTimeoutError::Disconnected => Error::NotStarted,
        })
    }

    /// Send an out-of-band block back to the sender
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

    pub fn oob_read(&self) -> Option<OobBlock> {
        self.oob_queue.pop()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().clone()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(mut runtime) = self.runtime.lock().take() {
            let _ = runtime.cmd_tx.send(Command::Shutdown);
            if let Some(handle) = runtime.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The active remote endpoint on one listener
struct PeerSession {
    id: PeerId,
    remote: SocketAddr,
    proto: Peer,
    disconnect_fired: bool,
}

struct ListenerRuntime {
    /// Handle returned to the application by `peer_add`
    id: PeerId,
    config: PeerConfig,
    socket: RistSocket,
    local: SocketAddr,
    session: Option<PeerSession>,
    /// Token bucket for the return channel (NACKs, RRs, OOB), refilled at
    /// `recovery_maxbitrate_return`
    return_pacer: RateLimiter,
}

/// Per-flow receiver bookkeeping beyond the protocol flow object
struct FlowState {
    flow: Flow,
    /// NTP middle word of the most recent data packet (RR `lsr`)
    last_data_middle: u32,
    last_data_arrival: Option<Instant>,
    /// RFC 3550 interarrival jitter, 1/65536 s units
    jitter_units: f64,
    last_transit: Option<i64>,
    dropped_deliveries: u64,
}

impl FlowState {
    /// Update the interarrival jitter estimate on a data arrival
    fn update_jitter(&mut self, ntp: u64) {
        let arrival = NtpTime::now().middle() as i64;
        let sent = (ntp >> 16) as u32 as i64;
        let transit = arrival - sent;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter_units += (d - self.jitter_units) / 16.0;
        }
        self.last_transit = Some(transit);
    }
}

struct ReceiverCore {
    cfg: ContextConfig,
    nack_type: NackType,
    listeners: Vec<ListenerRuntime>,
    flows: HashMap<u32, FlowState>,
    handlers: Handlers,
    rx: RxTransform,
    tx_oob: TxTransform,
    oob_queue: Arc<OobQueue>,
    stats_shared: Arc<Mutex<ReceiverStats>>,
    egress_tx: ChanSender<DataBlock>,
    cmd_rx: ChanReceiver<Command>,
    next_session_id: u64,
    rr_timer: Timer,
    stats_timer: Timer,
    malformed: u64,
    unauthorized: u64,
}

impl ReceiverCore {
    fn build(
        prep: PrepState,
        cmd_rx: ChanReceiver<Command>,
        egress_tx: ChanSender<DataBlock>,
        oob_queue: Arc<OobQueue>,
        stats_shared: Arc<Mutex<ReceiverStats>>,
    ) -> Result<ReceiverCore> {
        let rx = RxTransform::new(
            prep.secret
                .as_ref()
                .map(|(secret, size)| (secret.as_slice(), *size)),
        )
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let encryptor = match &prep.secret {
            Some((secret, size)) => Some(
                PskEncryptor::new(secret, *size).map_err(|e| Error::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let mut core = ReceiverCore {
            rr_timer: Timer::new(RR_INTERVAL),
            stats_timer: Timer::new(prep.cfg.stats_interval),
            tx_oob: TxTransform::new(false, encryptor),
            cfg: prep.cfg,
            nack_type: prep.nack_type,
            listeners: Vec::new(),
            flows: HashMap::new(),
            handlers: prep.handlers,
            rx,
            oob_queue,
            stats_shared,
            egress_tx,
            cmd_rx,
            next_session_id: 1 << 32,
            malformed: 0,
            unauthorized: 0,
        };

        for (id, config) in prep.peers {
            core.add_listener(id, config)?;
        }
        Ok(core)
    }

    fn add_listener(&mut self, id: PeerId, config: PeerConfig) -> Result<()> {
        let socket = RistSocket::bind(config.address)?;
        let local = socket.local_addr()?;
        let return_rate = config.recovery_maxbitrate_return.max(64_000) as u64;
        let return_pacer = RateLimiter::new(return_rate, (return_rate / 800).max(3000));
        tracing::info!(peer = id.0, %local, "receiver listening");
        self.listeners.push(ListenerRuntime {
            id,
            config,
            socket,
            local,
            session: None,
            return_pacer,
        });
        Ok(())
    }

    fn run(mut self) {
        loop {
            let now = Instant::now();
            self.drain_sockets(now);
            self.service_flows(now);
            self.service_sessions(now);
            self.publish_reports(now);
            self.publish_stats();

            let timeout = self.sleep_budget(Instant::now());
            let cmd_rx = self.cmd_rx.clone();
            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                default(timeout) => {}
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddPeer(id, config) => {
                if let Err(e) = self.add_listener(id, config) {
                    tracing::error!(error = %e, "failed to add listener");
                }
            }
            Command::RemovePeer(id) => {
                // `id` may name a configured listener or one of its sessions.
                for listener in &mut self.listeners {
                    let matches_listener = listener.id == id;
                    if let Some(session) = &mut listener.session {
                        if matches_listener || session.id == id {
                            let session_id = session.id;
                            session.proto.mark_removed();
                            fire_disconnect(session, &self.handlers);
                            for state in self.flows.values_mut() {
                                state.flow.remove_peer(session_id);
                            }
                            listener.session = None;
                        }
                    }
                }
                self.listeners.retain(|l| l.id != id);
            }
            Command::OobWrite(block) => self.send_oob(block),
            Command::Shutdown => unreachable!("handled by the select arm"),
        }
    }

    fn send_oob(&mut self, block: OobBlock) {
        if !self.cfg.profile.supports_aux() {
            tracing::debug!("oob block dropped: simple profile");
            return;
        }
        let ntp = if block.ts_ntp.as_raw() == 0 {
            NtpTime::now()
        } else {
            block.ts_ntp
        };

        let now = Instant::now();
        for listener in &mut self.listeners {
            let Some(session) = &listener.session else {
                continue;
            };
            if !session.proto.is_established() {
                continue;
            }
            if block.peer.map_or(false, |id| id != session.id) {
                continue;
            }
            let remote = session.remote;
            let out = self
                .tx_oob
                .apply(block.payload.clone(), 0, ntp.as_raw() as u32);
            let packet = OobPacket {
                meta: PacketMeta {
                    virt_src_port: 0,
                    virt_dst_port: listener.config.gre_dst_port,
                    flow_id: 0,
                    compressed: out.compressed,
                    salt: out.salt,
                },
                ntp: ntp.as_raw(),
                payload: out.payload,
            };
            let wire = packet.to_bytes();
            if listener.return_pacer.consume(wire.len(), now) {
                log_send(listener.socket.send_to(&wire, remote), "oob");
            }
        }
    }

    fn drain_sockets(&mut self, now: Instant) {
        let mut buf = [0u8; 2048];
        for idx in 0..self.listeners.len() {
            for _ in 0..RECV_BATCH {
                let listener = &mut self.listeners[idx];
                match listener.socket.try_recv_from(&mut buf) {
                    Ok(Some((len, from))) => {
                        let bytes = buf[..len].to_vec();
                        self.handle_datagram(idx, from, &bytes, now);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "socket receive error");
                        break;
                    }
                }
            }
        }
    }

    /// Resolve (or create) the session for a datagram source
    fn session_for(&mut self, idx: usize, from: SocketAddr, now: Instant) -> Option<usize> {
        let needs_new = match &self.listeners[idx].session {
            Some(session) if session.proto.is_dead() => true,
            Some(session) => {
                if session.remote != from {
                    tracing::debug!(%from, "datagram from unexpected source while session live");
                    return None;
                }
                false
            }
            None => true,
        };

        if needs_new {
            let id = PeerId(self.next_session_id);
            self.next_session_id += 1;

            let config = &self.listeners[idx].config;
            let mut proto = Peer::new(
                config.rtt_min(),
                config.rtt_max(),
                rist_protocol::BufferBloat::new(
                    config.buffer_bloat_mode,
                    config.bloat_limit(),
                    config.bloat_hard_limit(),
                ),
                self.cfg.keepalive_timeout,
                self.cfg.session_timeout,
                config.weight,
                now,
            );
            proto.touch(now);

            // Without a connect handler (or in the simple profile, which has
            // no cname exchange) the peer is implicitly accepted.
            if !self.cfg.profile.supports_aux() || self.handlers.connect.is_none() {
                let accepted = self.handlers.authorize(&ConnectRequest {
                    remote: from,
                    local: self.listeners[idx].local,
                    peer: id,
                    cname: String::new(),
                });
                proto.set_auth_result(accepted);
            }

            tracing::info!(peer = id.0, remote = %from, "new peer session");
            self.listeners[idx].session = Some(PeerSession {
                id,
                remote: from,
                proto,
                disconnect_fired: false,
            });
        }
        Some(idx)
    }

    fn handle_datagram(&mut self, idx: usize, from: SocketAddr, bytes: &[u8], now: Instant) {
        if self.session_for(idx, from, now).is_none() {
            return;
        }

        match rist_protocol::packet::classify(bytes) {
            WireKind::Rtp if !self.cfg.profile.supports_aux() => {
                let flow_id = if bytes.len() >= 12 {
                    u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])
                } else {
                    0
                };
                let reference = self
                    .flows
                    .get(&flow_id)
                    .map(|s| s.flow.high_water())
                    .unwrap_or(Seq::new(0));
                match DataPacket::from_rtp_bytes(bytes, reference) {
                    Ok(packet) => self.handle_data(idx, packet, now),
                    Err(e) => {
                        self.malformed += 1;
                        tracing::debug!(error = %e, "malformed rtp packet");
                    }
                }
            }
            WireKind::Rtp => {
                self.malformed += 1;
                tracing::debug!("rtp datagram on a main profile receiver");
            }
            WireKind::Envelope => match Packet::from_bytes(bytes) {
                Ok(packet) => self.handle_packet(idx, packet, now),
                Err(e) => {
                    self.malformed += 1;
                    tracing::debug!(error = %e, "malformed packet");
                }
            },
            WireKind::Unknown => {
                self.malformed += 1;
            }
        }
    }

    fn handle_packet(&mut self, idx: usize, packet: Packet, now: Instant) {
        match packet {
            Packet::Data(data) => self.handle_data(idx, data, now),
            Packet::KeepAlive(ka) => {
                let listener = &mut self.listeners[idx];
                let Some(session) = listener.session.as_mut() else {
                    return;
                };
                session.proto.on_keepalive(&ka.cname, ka.capabilities, now);
                if session.proto.state() == PeerState::Handshaking
                    && session.proto.handshake_complete()
                {
                    let request = ConnectRequest {
                        remote: session.remote,
                        local: listener.local,
                        peer: session.id,
                        cname: ka.cname.clone(),
                    };
                    let accepted = self.handlers.authorize(&request);
                    let session = self.listeners[idx].session.as_mut().expect("session above");
                    session.proto.set_auth_result(accepted);
                    if !accepted {
                        tracing::warn!(peer = session.id.0, "peer rejected by connect handler");
                        fire_disconnect(session, &self.handlers);
                    }
                }
            }
            Packet::Oob(oob) => {
                let Some(session) = self.listeners[idx].session.as_mut() else {
                    return;
                };
                session.proto.touch(now);
                let peer_id = session.id;
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
                            peer: Some(peer_id),
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
                        let session = self.listeners[idx].session.as_mut().expect("session above");
                        if session.proto.on_decrypt_failure(now) {
                            fire_disconnect(session, &self.handlers);
                        }
                        tracing::debug!(peer = peer_id.0, "oob decrypt failed");
                    }
                }
            }
            other => {
                tracing::debug!(
                    payload_type = %other.payload_type(),
                    "unexpected control packet at receiver"
                );
            }
        }
    }

    fn handle_data(&mut self, idx: usize, packet: DataPacket, now: Instant) {
        let listener = &self.listeners[idx];
        let Some(session) = listener.session.as_ref() else {
            return;
        };
        let peer_id = session.id;

        if !session.proto.is_established() {
            // Authentication still pending; the packet is not for us yet.
            self.unauthorized += 1;
            tracing::debug!(peer = peer_id.0, "data before authentication dropped");
            return;
        }

        let seq_word = packet.seq.as_raw();
        let flow_id = packet.meta.flow_id;
        let restored = self.rx.restore(
            packet.meta.salt.as_ref(),
            packet.meta.compressed,
            packet.payload,
            flow_id,
            seq_word,
        );
        let payload = match restored {
            Ok(payload) => payload,
            Err(RxError::DecryptFailed) => {
                let session = self.listeners[idx].session.as_mut().expect("session above");
                if session.proto.on_decrypt_failure(now) {
                    fire_disconnect(session, &self.handlers);
                }
                tracing::debug!(peer = peer_id.0, seq = seq_word, "decrypt failed");
                return;
            }
            Err(RxError::Malformed) => {
                self.malformed += 1;
                tracing::debug!(peer = peer_id.0, seq = seq_word, "decompression failed");
                return;
            }
        };

        {
            let session = self.listeners[idx].session.as_mut().expect("session above");
            session.proto.on_traffic(now);
        }

        // Lazily create the flow with the delivering listener's recovery
        // configuration.
        if !self.flows.contains_key(&flow_id) {
            let config = &self.listeners[idx].config;
            let window_ms = config.recovery_window_ms(config.recovery_length_max)
                + config.recovery_reorder_buffer;
            let window =
                ring_capacity(window_ms, config.recovery_maxbitrate, DEFAULT_MTU).min(1 << 16);
            match Flow::new(
                flow_id,
                window,
                config.recovery_min(),
                config.rtt_min(),
                config.rtt_max(),
                DEFAULT_MAX_RETRIES,
                self.nack_type,
                now,
            ) {
                Ok(flow) => {
                    tracing::info!(flow = flow_id, window, "flow created");
                    self.flows.insert(
                        flow_id,
                        FlowState {
                            flow,
                            last_data_middle: 0,
                            last_data_arrival: None,
                            jitter_units: 0.0,
                            last_transit: None,
                            dropped_deliveries: 0,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(flow = flow_id, error = %e, "flow creation failed");
                    return;
                }
            }
        }

        let state = self.flows.get_mut(&flow_id).expect("inserted above");
        state.update_jitter(packet.ntp);
        state.last_data_middle = (packet.ntp >> 16) as u32;
        state.last_data_arrival = Some(now);

        let clean = DataPacket {
            meta: PacketMeta {
                salt: None,
                compressed: false,
                ..packet.meta
            },
            seq: packet.seq,
            ntp: packet.ntp,
            payload,
        };
        let output = state.flow.handle_data(clean, peer_id, now);

        let released = output.released;
        if !released.is_empty() {
            self.deliver(flow_id, released, peer_id);
        }
    }

    fn deliver(&mut self, flow_id: u32, packets: Vec<DataPacket>, peer: PeerId) {
        for packet in packets {
            let block = DataBlock {
                payload: packet.payload,
                ts_ntp: NtpTime::from_raw(packet.ntp),
                virt_src_port: packet.meta.virt_src_port,
                virt_dst_port: packet.meta.virt_dst_port,
                flow_id,
                seq: packet.seq.as_raw(),
                peer: Some(peer),
            };
            match &self.handlers.data {
                Some(cb) => cb(block),
                None => {
                    if self.egress_tx.try_send(block).is_err() {
                        if let Some(state) = self.flows.get_mut(&flow_id) {
                            state.dropped_deliveries += 1;
                            tracing::debug!(
                                flow = flow_id,
                                total = state.dropped_deliveries,
                                "delivery queue full, block dropped"
                            );
                        }
                    }
                }
            }
        }
    }

    fn service_flows(&mut self, now: Instant) {
        let flow_ids: Vec<u32> = self.flows.keys().copied().collect();
        for flow_id in flow_ids {
            // In-order release on expired deadlines.
            let (released, last_peer) = {
                let state = self.flows.get_mut(&flow_id).expect("key from map");
                let released = state.flow.release(now);
                let last_peer = state
                    .flow
                    .peers()
                    .last()
                    .copied()
                    .unwrap_or(PeerId(0));
                (released, last_peer)
            };
            if !released.is_empty() {
                self.deliver(flow_id, released, last_peer);
            }

            // Fire due NACK timers and route the payloads.
            let nacks = {
                let state = self.flows.get_mut(&flow_id).expect("key from map");
                state.flow.poll_nacks(now)
            };
            for (peer, payload) in nacks {
                self.send_nack(flow_id, peer, payload, now);
            }
        }
    }

    fn send_nack(
        &mut self,
        flow_id: u32,
        peer: PeerId,
        payload: rist_protocol::NackPayload,
        now: Instant,
    ) {
        for listener in &mut self.listeners {
            let Some(session) = &listener.session else {
                continue;
            };
            if session.id != peer || session.proto.is_dead() {
                continue;
            }
            let meta = PacketMeta {
                virt_src_port: 0,
                virt_dst_port: listener.config.gre_dst_port,
                flow_id,
                compressed: false,
                salt: None,
            };
            let remote = session.remote;
            let packet = payload.into_packet(meta);
            match packet.to_bytes() {
                Ok(wire) => {
                    // Return-channel budget; a starved NACK retries on the
                    // slot's next backoff interval.
                    if listener.return_pacer.consume(wire.len(), now) {
                        log_send(listener.socket.send_to(&wire, remote), "nack");
                    } else {
                        tracing::debug!(peer = peer.0, "return channel budget exhausted");
                    }
                }
                Err(e) => tracing::error!(error = %e, "nack encode failed"),
            }
            return;
        }
        tracing::debug!(peer = peer.0, "nack target session gone");
    }

    fn service_sessions(&mut self, now: Instant) {
        let simple = !self.cfg.profile.supports_aux();
        let cname = self.cfg.cname.clone();

        for listener in &mut self.listeners {
            let Some(session) = listener.session.as_mut() else {
                continue;
            };
            for event in session.proto.poll(now) {
                match event {
                    PeerEvent::SendKeepAlive if !simple => {
                        let packet = KeepAlivePacket {
                            meta: PacketMeta {
                                virt_src_port: 0,
                                virt_dst_port: listener.config.gre_dst_port,
                                flow_id: 0,
                                compressed: false,
                                salt: None,
                            },
                            capabilities: crate::caps::RETRANSMIT | crate::caps::OOB,
                            cname: cname.clone(),
                        };
                        match packet.to_bytes() {
                            Ok(wire) => {
                                log_send(listener.socket.send_to(&wire, session.remote), "keepalive")
                            }
                            Err(e) => tracing::error!(error = %e, "keepalive encode failed"),
                        }
                    }
                    PeerEvent::SendKeepAlive => {}
                    PeerEvent::Died(reason) => {
                        tracing::warn!(peer = session.id.0, ?reason, "peer died");
                        fire_disconnect(session, &self.handlers);
                        for state in self.flows.values_mut() {
                            state.flow.remove_peer(session.id);
                        }
                    }
                }
            }
            // A dead session slot frees up; a reconnecting remote gets a new
            // peer handle.
            if session.proto.is_dead() && session.disconnect_fired {
                listener.session = None;
            }
        }
    }

    /// Emit RTCP-style receiver reports for every flow/peer pairing
    fn publish_reports(&mut self, now: Instant) {
        if !self.rr_timer.try_fire() {
            return;
        }

        for (flow_id, state) in &self.flows {
            let counters = state.flow.counters();
            let dlsr = state
                .last_data_arrival
                .map(|at| (now.duration_since(at).as_secs_f64() * 65_536.0) as u32)
                .unwrap_or(0);
            let report = ReceiverReport {
                received: counters.received as u32,
                lost: counters.lost as u32,
                jitter: state.jitter_units as u32,
                lsr: state.last_data_middle,
                dlsr,
            };

            for peer in state.flow.peers() {
                for listener in &mut self.listeners {
                    let Some(session) = &listener.session else {
                        continue;
                    };
                    if session.id != *peer || session.proto.is_dead() {
                        continue;
                    }
                    let packet = ReceiverReportPacket {
                        meta: PacketMeta {
                            virt_src_port: 0,
                            virt_dst_port: listener.config.gre_dst_port,
                            flow_id: *flow_id,
                            compressed: false,
                            salt: None,
                        },
                        report,
                    };
                    let wire = packet.to_bytes();
                    if listener.return_pacer.consume(wire.len(), now) {
                        log_send(listener.socket.send_to(&wire, session.remote), "rr");
                    }
                }
            }
        }
    }

    fn publish_stats(&mut self) {
        if !self.stats_timer.try_fire() {
            return;
        }
        let snapshot = ReceiverStats {
            flows: self
                .flows
                .iter()
                .map(|(id, state)| FlowStats::from_counters(*id, state.flow.counters()))
                .collect(),
        };
        *self.stats_shared.lock() = snapshot.clone();
        if let Some(cb) = &self.handlers.stats {
            cb(&StatsSnapshot::Receiver(snapshot));
        }
    }

    fn sleep_budget(&self, now: Instant) -> Duration {
        let mut deadline = now + self.cfg.max_jitter;

        for state in self.flows.values() {
            if let Some(d) = state.flow.next_deadline() {
                deadline = deadline.min(d);
            }
        }
        for listener in &self.listeners {
            if let Some(session) = &listener.session {
                if !session.proto.is_dead() {
                    deadline = deadline.min(session.proto.next_deadline());
                }
            }
        }

        deadline
            .saturating_duration_since(now)
            .max(Duration::from_micros(200))
    }

    fn shutdown(&mut self) {
        // Flush everything already past its deadline, then disconnect peers.
        let now = Instant::now();
        self.service_flows(now);
        for listener in &mut self.listeners {
            if let Some(session) = listener.session.as_mut() {
                if !session.proto.is_dead() {
                    session.proto.mark_removed();
                }
                fire_disconnect(session, &self.handlers);
            }
        }
        tracing::info!(
            malformed = self.malformed,
            unauthorized = self.unauthorized,
            "receiver context destroyed"
        );
    }
}

fn fire_disconnect(session: &mut PeerSession, handlers: &Handlers) {
    if !session.disconnect_fired {
        session.disconnect_fired = true;
        handlers.on_disconnect(session.id);
    }
}

fn log_send(result: std::result::Result<usize, rist_io::SocketError>, kind: &str) {
    if let Err(e) = result {
        if !e.is_would_block() {
            tracing::debug!(kind, error = %e, "send failed");
        }
    }
}
