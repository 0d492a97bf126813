//! Peer state machine
//!
//! A peer is one configured remote endpoint. It moves through
//! `idle → handshaking → authenticated → active → dead`, driven by inbound
//! packets, the application's authentication verdict, and time. The peer
//! also owns the per-endpoint RTT estimate, keep-alive scheduling, the
//! decryption failure window, and the buffer-bloat congestion gate that the
//! sender's pacer consults.

use std::time::{Duration, Instant};

/// Default keep-alive timeout; keep-alives are sent at a third of this
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default inbound-silence limit before a peer is declared dead
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Decryption failures tolerated within [`DECRYPT_FAILURE_WINDOW`]
pub const DECRYPT_FAILURE_LIMIT: u32 = 16;
pub const DECRYPT_FAILURE_WINDOW: Duration = Duration::from_secs(2);

/// Peer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Handshaking,
    Authenticated,
    Active,
    Dead,
}

/// Why a peer died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// No inbound packets within the session timeout
    Timeout,
    /// The application's connect callback declined the peer
    AuthRejected,
    /// Too many decryption failures in a short window
    DecryptFailures,
    /// Removed by the application
    Removed,
}

/// Events produced by [`Peer::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A keep-alive is owed to this peer
    SendKeepAlive,
    /// The peer transitioned to dead
    Died(DeathReason),
}

/// Smoothed round-trip estimator, EWMA with α = 1/8
///
/// Samples and the smoothed value are clamped to the configured
/// [`rtt_min`, `rtt_max`] bounds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    min_seen_ms: f64,
    max_seen_ms: f64,
    floor: Duration,
    ceiling: Duration,
    samples: u64,
}

impl RttEstimator {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let initial = floor.as_secs_f64() * 1000.0;
        RttEstimator {
            srtt_ms: initial,
            min_seen_ms: initial,
            max_seen_ms: initial,
            floor,
            ceiling,
            samples: 0,
        }
    }

    pub fn update(&mut self, sample: Duration) {
        let clamped = sample.clamp(self.floor, self.ceiling);
        let ms = clamped.as_secs_f64() * 1000.0;

        if self.samples == 0 {
            self.srtt_ms = ms;
        } else {
            const ALPHA: f64 = 1.0 / 8.0;
            self.srtt_ms += ALPHA * (ms - self.srtt_ms);
        }
        self.samples += 1;
        self.min_seen_ms = self.min_seen_ms.min(ms);
        self.max_seen_ms = self.max_seen_ms.max(ms);
    }

    pub fn smoothed(&self) -> Duration {
        Duration::from_secs_f64(self.srtt_ms / 1000.0)
    }

    pub fn min_seen(&self) -> Duration {
        Duration::from_secs_f64(self.min_seen_ms / 1000.0)
    }

    pub fn max_seen(&self) -> Duration {
        Duration::from_secs_f64(self.max_seen_ms / 1000.0)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Buffer-bloat control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferBloatMode {
    #[default]
    Off,
    Normal,
    Aggressive,
}

/// RTT-inflation gate over the sender's output
///
/// NORMAL drops newly generated retransmissions while the smoothed RTT sits
/// above `limit`, releasing them once it falls below the low-water mark.
/// AGGRESSIVE uses a lower low-water mark and additionally pauses originals
/// for one RTT whenever the smoothed RTT crosses `hard_limit`.
#[derive(Debug, Clone)]
pub struct BufferBloat {
    mode: BufferBloatMode,
    limit: Duration,
    hard_limit: Duration,
    dropping_retransmits: bool,
    originals_paused_until: Option<Instant>,
}

impl BufferBloat {
    pub fn new(mode: BufferBloatMode, limit: Duration, hard_limit: Duration) -> Self {
        BufferBloat {
            mode,
            limit,
            hard_limit,
            dropping_retransmits: false,
            originals_paused_until: None,
        }
    }

    fn low_water(&self) -> Duration {
        match self.mode {
            BufferBloatMode::Aggressive => self.limit / 2,
            _ => self.limit.mul_f64(0.875),
        }
    }

    /// Feed a new smoothed RTT
    pub fn on_rtt(&mut self, srtt: Duration, now: Instant) {
        if self.mode == BufferBloatMode::Off {
            return;
        }

        if self.dropping_retransmits {
            if srtt < self.low_water() {
                self.dropping_retransmits = false;
            }
        } else if srtt > self.limit {
            self.dropping_retransmits = true;
        }

        if self.mode == BufferBloatMode::Aggressive
            && srtt > self.hard_limit
            && self.originals_paused_until.map_or(true, |t| now >= t)
        {
            self.originals_paused_until = Some(now + srtt);
        }
    }

    pub fn allow_retransmit(&self) -> bool {
        !self.dropping_retransmits
    }

    pub fn allow_original(&self, now: Instant) -> bool {
        match self.originals_paused_until {
            Some(until) if self.mode == BufferBloatMode::Aggressive => now >= until,
            _ => true,
        }
    }

    pub fn is_throttling(&self) -> bool {
        self.dropping_retransmits
    }
}

/// Per-endpoint protocol state
pub struct Peer {
    state: PeerState,
    death: Option<DeathReason>,
    /// Canonical name learned from the remote's keep-alives
    remote_cname: Option<String>,
    remote_capabilities: u32,
    weight: u32,
    rtt: RttEstimator,
    bloat: BufferBloat,
    keepalive_interval: Duration,
    session_timeout: Duration,
    last_rx: Instant,
    next_keepalive: Instant,
    decrypt_failures: u32,
    decrypt_window_start: Instant,
}

impl Peer {
    pub fn new(
        rtt_floor: Duration,
        rtt_ceiling: Duration,
        bloat: BufferBloat,
        keepalive_timeout: Duration,
        session_timeout: Duration,
        weight: u32,
        now: Instant,
    ) -> Self {
        let keepalive_interval = keepalive_timeout / 3;
        Peer {
            state: PeerState::Idle,
            death: None,
            remote_cname: None,
            remote_capabilities: 0,
            weight,
            rtt: RttEstimator::new(rtt_floor, rtt_ceiling),
            bloat,
            keepalive_interval,
            session_timeout,
            last_rx: now,
            // First keep-alive goes out immediately and opens the handshake.
            next_keepalive: now,
            decrypt_failures: 0,
            decrypt_window_start: now,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn death_reason(&self) -> Option<DeathReason> {
        self.death
    }

    pub fn is_dead(&self) -> bool {
        self.state == PeerState::Dead
    }

    /// Peer may carry data: authenticated or active
    pub fn is_established(&self) -> bool {
        matches!(self.state, PeerState::Authenticated | PeerState::Active)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn remote_cname(&self) -> Option<&str> {
        self.remote_cname.as_deref()
    }

    pub fn remote_capabilities(&self) -> u32 {
        self.remote_capabilities
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn bloat(&self) -> &BufferBloat {
        &self.bloat
    }

    /// Record an RTT sample from a request/response pair
    pub fn rtt_sample(&mut self, sample: Duration, now: Instant) {
        self.rtt.update(sample);
        self.bloat.on_rtt(self.rtt.smoothed(), now);
    }

    /// Any inbound packet resets the liveness deadline
    pub fn touch(&mut self, now: Instant) {
        if self.state == PeerState::Dead {
            return;
        }
        self.last_rx = now;
        if self.state == PeerState::Idle {
            self.state = PeerState::Handshaking;
        }
    }

    /// Remote keep-alive observed; completes the cname/version exchange
    pub fn on_keepalive(&mut self, cname: &str, capabilities: u32, now: Instant) {
        self.touch(now);
        self.remote_cname = Some(cname.to_string());
        self.remote_capabilities = capabilities;
    }

    /// Whether the exchange needed before authentication has completed
    pub fn handshake_complete(&self) -> bool {
        self.remote_cname.is_some()
    }

    /// Apply the application's authentication verdict
    ///
    /// An implicit accept (no handler installed) passes `true`.
    pub fn set_auth_result(&mut self, accepted: bool) {
        match self.state {
            PeerState::Handshaking => {
                if accepted {
                    self.state = PeerState::Authenticated;
                } else {
                    self.die(DeathReason::AuthRejected);
                }
            }
            _ => {}
        }
    }

    /// First data or receiver report exchanged
    pub fn on_traffic(&mut self, now: Instant) {
        self.touch(now);
        if self.state == PeerState::Authenticated {
            self.state = PeerState::Active;
        }
    }

    /// Record a decryption failure; returns true if the peer just died
    pub fn on_decrypt_failure(&mut self, now: Instant) -> bool {
        if now.duration_since(self.decrypt_window_start) > DECRYPT_FAILURE_WINDOW {
            self.decrypt_window_start = now;
            self.decrypt_failures = 0;
        }
        self.decrypt_failures += 1;
        if self.decrypt_failures >= DECRYPT_FAILURE_LIMIT && self.state != PeerState::Dead {
            self.die(DeathReason::DecryptFailures);
            return true;
        }
        false
    }

    pub fn mark_removed(&mut self) {
        if self.state != PeerState::Dead {
            self.die(DeathReason::Removed);
        }
    }

    fn die(&mut self, reason: DeathReason) {
        self.state = PeerState::Dead;
        self.death = Some(reason);
    }

    /// Next instant this peer needs attention
    pub fn next_deadline(&self) -> Instant {
        std::cmp::min(self.next_keepalive, self.last_rx + self.session_timeout)
    }

    /// Advance time: emits owed keep-alives and the death transition
    pub fn poll(&mut self, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        if self.state == PeerState::Dead {
            return events;
        }

        if now.duration_since(self.last_rx) >= self.session_timeout {
            self.die(DeathReason::Timeout);
            events.push(PeerEvent::Died(DeathReason::Timeout));
            return events;
        }

        if now >= self.next_keepalive {
            if self.state == PeerState::Idle {
                self.state = PeerState::Handshaking;
            }
            self.next_keepalive = now + self.keepalive_interval;
            events.push(PeerEvent::SendKeepAlive);
        }

        events
    }
}
