//! Peer and context configuration
//!
//! Mirrors the recognized per-peer options; validation happens before any
//! socket or thread is touched, so a rejected configuration has no side
//! effects.

use crate::error::{Error, Result};
use rist_protocol::BufferBloatMode;
use std::net::SocketAddr;
use std::time::Duration;

/// RIST profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Plain RTP data, no envelope, no OOB/keep-alive/compression
    Simple,
    #[default]
    Main,
    /// Framed like main; negotiated extras are capability bits
    Advanced,
}

impl Profile {
    pub fn supports_aux(self) -> bool {
        !matches!(self, Profile::Simple)
    }
}

/// Loss recovery mode for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    #[default]
    Unconfigured,
    Disabled,
    /// Recovery window expressed in bytes
    Bytes,
    /// Recovery window expressed in milliseconds
    Time,
}

/// Datagram budget per packet used for ring sizing
pub const DEFAULT_MTU: usize = 1500;

/// NACK retries before a sequence is abandoned
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Per-peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Remote endpoint (sender side) or local listen address (receiver side)
    pub address: SocketAddr,
    /// Destination virtual port carried in the envelope
    pub gre_dst_port: u16,

    pub recovery_mode: RecoveryMode,
    /// Peak bitrate for ring sizing and the pacer token bucket, bits/s
    pub recovery_maxbitrate: u32,
    /// Bitrate budget for the return (NACK/RR) channel, bits/s
    pub recovery_maxbitrate_return: u32,
    /// Packets are held this long for repair before release (ms or bytes,
    /// per `recovery_mode`; the engine normalizes bytes to time)
    pub recovery_length_min: u32,
    /// Retransmit ring retention (same unit)
    pub recovery_length_max: u32,
    /// Extra reorder tolerance, ms
    pub recovery_reorder_buffer: u32,
    /// RTT clamp floor, ms; also the delay before a gap's first NACK
    pub recovery_rtt_min: u32,
    /// RTT clamp ceiling, ms; also the NACK backoff ceiling
    pub recovery_rtt_max: u32,
    /// Relative share when several peers carry one flow
    pub weight: u32,

    pub buffer_bloat_mode: BufferBloatMode,
    /// Smoothed RTT (ms) above which retransmissions are gated
    pub buffer_bloat_limit: u32,
    /// Smoothed RTT (ms) above which AGGRESSIVE pauses originals for one RTT
    pub buffer_bloat_hard_limit: u32,
}

impl PeerConfig {
    pub fn new(address: SocketAddr) -> Self {
        PeerConfig {
            address,
            gre_dst_port: 1968,
            recovery_mode: RecoveryMode::Time,
            recovery_maxbitrate: 100_000_000,
            recovery_maxbitrate_return: 5_000_000,
            recovery_length_min: 1000,
            recovery_length_max: 1000,
            recovery_reorder_buffer: 25,
            recovery_rtt_min: 50,
            recovery_rtt_max: 500,
            weight: 5,
            buffer_bloat_mode: BufferBloatMode::Off,
            buffer_bloat_limit: 100,
            buffer_bloat_hard_limit: 200,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.recovery_maxbitrate == 0 {
            return Err(Error::InvalidConfig(
                "recovery_maxbitrate must be non-zero".into(),
            ));
        }
        if self.recovery_mode != RecoveryMode::Disabled {
            if self.recovery_length_min == 0 {
                return Err(Error::InvalidConfig(
                    "recovery_length_min must be non-zero".into(),
                ));
            }
            if self.recovery_length_min > self.recovery_length_max {
                return Err(Error::InvalidConfig(
                    "recovery_length_min exceeds recovery_length_max".into(),
                ));
            }
        }
        if self.recovery_rtt_min == 0 || self.recovery_rtt_min > self.recovery_rtt_max {
            return Err(Error::InvalidConfig(
                "recovery_rtt bounds are inverted or zero".into(),
            ));
        }
        if self.buffer_bloat_mode != BufferBloatMode::Off {
            if self.buffer_bloat_limit == 0
                || self.buffer_bloat_limit > self.buffer_bloat_hard_limit
            {
                return Err(Error::InvalidConfig(
                    "buffer_bloat limits are inverted or zero".into(),
                ));
            }
        }
        Ok(())
    }

    /// Recovery window in milliseconds, normalizing byte-mode windows
    pub fn recovery_window_ms(&self, length: u32) -> u32 {
        match self.recovery_mode {
            RecoveryMode::Bytes => {
                // bytes / (bitrate / 8) seconds
                let bytes_per_ms = (self.recovery_maxbitrate as u64 / 8000).max(1);
                (length as u64 / bytes_per_ms).max(1) as u32
            }
            _ => length,
        }
    }

    pub fn recovery_min(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms(self.recovery_length_min) as u64)
    }

    pub fn recovery_max(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms(self.recovery_length_max) as u64)
    }

    pub fn rtt_min(&self) -> Duration {
        Duration::from_millis(self.recovery_rtt_min as u64)
    }

    pub fn rtt_max(&self) -> Duration {
        Duration::from_millis(self.recovery_rtt_max as u64)
    }

    pub fn bloat_limit(&self) -> Duration {
        Duration::from_millis(self.buffer_bloat_limit as u64)
    }

    pub fn bloat_hard_limit(&self) -> Duration {
        Duration::from_millis(self.buffer_bloat_hard_limit as u64)
    }
}

/// Context-wide tunables shared by sender and receiver
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub profile: Profile,
    pub cname: String,
    /// A peer silent this long is dead
    pub session_timeout: Duration,
    /// Keep-alives go out at a third of this
    pub keepalive_timeout: Duration,
    /// Upper bound on the event loop sleep, bounding release jitter
    pub max_jitter: Duration,
    /// Stats callback interval
    pub stats_interval: Duration,
    /// Application-facing queue depths
    pub queue_depth: usize,
}

impl ContextConfig {
    pub fn new(profile: Profile) -> Self {
        ContextConfig {
            profile,
            cname: default_cname(),
            session_timeout: rist_protocol::peer::DEFAULT_SESSION_TIMEOUT,
            keepalive_timeout: rist_protocol::peer::DEFAULT_KEEPALIVE_TIMEOUT,
            max_jitter: Duration::from_millis(5),
            stats_interval: Duration::from_secs(1),
            queue_depth: 1024,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cname.len() > rist_protocol::packet::MAX_CNAME {
            return Err(Error::InvalidConfig("cname exceeds 128 bytes".into()));
        }
        if self.session_timeout.is_zero() || self.keepalive_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}

/// Auto-generated SDES-style cname: host plus process id
fn default_cname() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "rist".to_string());
    let mut cname = format!("{}:{}", host, std::process::id());
    cname.truncate(rist_protocol::packet::MAX_CNAME);
    cname
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PeerConfig {
        PeerConfig::new("203.0.113.1:1968".parse().unwrap())
    }

    #[test]
    fn test_default_config_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_zero_bitrate_rejected() {
        let mut c = config();
        c.recovery_maxbitrate = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_inverted_lengths_rejected() {
        let mut c = config();
        c.recovery_length_min = 2000;
        c.recovery_length_max = 1000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_inverted_rtt_rejected() {
        let mut c = config();
        c.recovery_rtt_min = 600;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_disabled_recovery_skips_length_checks() {
        let mut c = config();
        c.recovery_mode = RecoveryMode::Disabled;
        c.recovery_length_min = 0;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_bloat_limits_checked_when_enabled() {
        let mut c = config();
        c.buffer_bloat_mode = BufferBloatMode::Normal;
        c.buffer_bloat_limit = 300;
        c.buffer_bloat_hard_limit = 200;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_byte_mode_window_normalization() {
        let mut c = config();
        c.recovery_mode = RecoveryMode::Bytes;
        c.recovery_maxbitrate = 8_000_000; // 1000 bytes per ms
        // A 500 kB window at 1 MB/s is 500 ms.
        assert_eq!(c.recovery_window_ms(500_000), 500);
    }

    #[test]
    fn test_context_config() {
        let c = ContextConfig::new(Profile::Main);
        assert!(c.validate().is_ok());
        assert!(c.cname.len() <= rist_protocol::packet::MAX_CNAME);
    }
}
