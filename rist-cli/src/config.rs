//! Configuration file support for the RIST CLI tools

use rist::{BufferBloatMode, PeerConfig, Profile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// One peer endpoint in a config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Remote address (sender) or local listen address (receiver)
    pub address: SocketAddr,
    #[serde(default = "default_gre_port")]
    pub gre_dst_port: u16,
    #[serde(default = "default_bitrate")]
    pub recovery_maxbitrate: u32,
    #[serde(default = "default_length")]
    pub recovery_length_min: u32,
    #[serde(default = "default_length")]
    pub recovery_length_max: u32,
    #[serde(default = "default_rtt_min")]
    pub recovery_rtt_min: u32,
    #[serde(default = "default_rtt_max")]
    pub recovery_rtt_max: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub buffer_bloat: BloatMode,
}

fn default_gre_port() -> u16 {
    1968
}
fn default_bitrate() -> u32 {
    100_000_000
}
fn default_length() -> u32 {
    1000
}
fn default_rtt_min() -> u32 {
    50
}
fn default_rtt_max() -> u32 {
    500
}
fn default_weight() -> u32 {
    5
}

/// Buffer-bloat control mode in config files
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BloatMode {
    #[default]
    Off,
    Normal,
    Aggressive,
}

impl From<BloatMode> for BufferBloatMode {
    fn from(mode: BloatMode) -> Self {
        match mode {
            BloatMode::Off => BufferBloatMode::Off,
            BloatMode::Normal => BufferBloatMode::Normal,
            BloatMode::Aggressive => BufferBloatMode::Aggressive,
        }
    }
}

impl PeerEntry {
    /// Translate into the library's peer configuration
    pub fn to_peer_config(&self) -> PeerConfig {
        let mut config = PeerConfig::new(self.address);
        config.gre_dst_port = self.gre_dst_port;
        config.recovery_maxbitrate = self.recovery_maxbitrate;
        config.recovery_length_min = self.recovery_length_min;
        config.recovery_length_max = self.recovery_length_max;
        config.recovery_rtt_min = self.recovery_rtt_min;
        config.recovery_rtt_max = self.recovery_rtt_max;
        config.weight = self.weight;
        config.buffer_bloat_mode = self.buffer_bloat.into();
        config
    }
}

/// RIST profile in config files
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Simple,
    #[default]
    Main,
    Advanced,
}

impl From<ProfileName> for Profile {
    fn from(name: ProfileName) -> Self {
        match name {
            ProfileName::Simple => Profile::Simple,
            ProfileName::Main => Profile::Main,
            ProfileName::Advanced => Profile::Advanced,
        }
    }
}

/// Tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profile: ProfileName,
    /// Pre-shared passphrase; enables AES when set
    pub secret: Option<String>,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default)]
    pub compression: u8,
    pub cname: Option<String>,
    pub peers: Vec<PeerEntry>,
    #[serde(default = "default_stats_secs")]
    pub stats_interval_secs: u64,
}

fn default_key_size() -> u32 {
    128
}
fn default_stats_secs() -> u64 {
    1
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn example() -> Self {
        Config {
            profile: ProfileName::Main,
            secret: None,
            key_size: 128,
            compression: 0,
            cname: None,
            peers: vec![PeerEntry {
                address: "203.0.113.10:1968".parse().unwrap(),
                gre_dst_port: 1968,
                recovery_maxbitrate: 10_000_000,
                recovery_length_min: 1000,
                recovery_length_max: 1000,
                recovery_rtt_min: 50,
                recovery_rtt_max: 500,
                weight: 5,
                buffer_bloat: BloatMode::Off,
            }],
            stats_interval_secs: 1,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_roundtrip() {
        let config = Config::example();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].address, config.peers[0].address);
    }

    #[test]
    fn test_defaults_fill_in() {
        let parsed: Config = toml::from_str(
            r#"
            [[peers]]
            address = "10.0.0.1:1968"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.peers[0].recovery_length_min, 1000);
        assert_eq!(parsed.peers[0].weight, 5);
        assert_eq!(parsed.key_size, 128);
    }

    #[test]
    fn test_to_peer_config() {
        let entry = Config::example().peers.remove(0);
        let config = entry.to_peer_config();
        assert_eq!(config.recovery_maxbitrate, 10_000_000);
        assert!(config.validate().is_ok());
    }
}
