//! Time utilities for the RIST engine
//!
//! Provides the 64-bit NTP timestamp format data packets carry end-to-end, a
//! monotonic timestamp for internal scheduling, a periodic timer, and the
//! token-bucket rate limiter the sender's pacer is built on.

use std::ops::{Add, Sub};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp: seconds since 1900 in the upper 32 bits, fractional
/// seconds (units of 1/2^32 s) in the lower 32
///
/// The framer stamps capture time in this format and the receiver preserves
/// it end-to-end; it is never used as an ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NtpTime(u64);

impl NtpTime {
    pub fn from_raw(raw: u64) -> Self {
        NtpTime(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Current wall-clock time in NTP format
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
        let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTime((secs << 32) | frac)
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fractional part in units of 1/2^32 seconds
    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Middle 32 bits, the compact form used in RTCP LSR fields
    pub fn middle(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Absolute difference between two stamps
    pub fn abs_diff(self, other: NtpTime) -> Duration {
        let diff = self.0.abs_diff(other.0);
        let secs = diff >> 32;
        let nanos = ((diff & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        Duration::new(secs, nanos as u32)
    }
}

/// Monotonic timestamp used for internal deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    #[inline]
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    #[inline]
    pub fn from_instant(instant: Instant) -> Self {
        Timestamp(instant)
    }

    #[inline]
    pub fn as_instant(&self) -> Instant {
        self.0
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.duration_since(earlier.0)
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0 + duration)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, duration: Duration) -> Timestamp {
        Timestamp(self.0 - duration)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.0.duration_since(other.0)
    }
}

/// Timer for periodic operations
///
/// Used for stats intervals, receiver report emission, and keep-alive ticks.
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last_fire = Instant::now();
    }

    pub fn time_until_expiration(&self) -> Duration {
        let elapsed = self.last_fire.elapsed();
        if elapsed >= self.interval {
            Duration::ZERO
        } else {
            self.interval - elapsed
        }
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self) -> bool {
        if self.expired() {
            self.reset();
            true
        } else {
            false
        }
    }
}

/// Rate limiter using the token bucket algorithm
///
/// The sender refills one bucket per peer at `recovery_maxbitrate`;
/// retransmissions and originals consume from the same bucket.
pub struct RateLimiter {
    /// Maximum tokens (burst size, bytes)
    capacity: u64,
    /// Current token count
    tokens: u64,
    /// Tokens added per microsecond
    rate: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// `rate_bps` in bits per second, `burst_bytes` the bucket depth
    pub fn new(rate_bps: u64, burst_bytes: u64) -> Self {
        let rate_bytes_per_us = (rate_bps as f64) / 8.0 / 1_000_000.0;

        RateLimiter {
            capacity: burst_bytes,
            tokens: burst_bytes,
            rate: rate_bytes_per_us,
            last_update: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate_bps: u64) {
        self.refill(Instant::now());
        self.rate = (rate_bps as f64) / 8.0 / 1_000_000.0;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_us = now.duration_since(self.last_update).as_micros() as f64;
        let new_tokens = (elapsed_us * self.rate) as u64;

        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_update = now;
        }
    }

    /// Whether `bytes` could be sent right now
    pub fn check(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= bytes as u64
    }

    /// Consume tokens for `bytes`; false when the bucket is short
    pub fn consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes as u64 {
            self.tokens -= bytes as u64;
            true
        } else {
            false
        }
    }

    /// Time until `bytes` worth of tokens will be available
    pub fn time_to_available(&mut self, bytes: usize, now: Instant) -> Duration {
        self.refill(now);

        if self.tokens >= bytes as u64 {
            return Duration::ZERO;
        }

        let needed = (bytes as u64) - self.tokens;
        let micros = (needed as f64 / self.rate).ceil() as u64;
        Duration::from_micros(micros)
    }
}
