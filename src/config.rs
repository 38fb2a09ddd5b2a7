//! Configuration for every layer of a session

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto_manager::CryptoStandard;
use crate::error::ProtocolResult;
use crate::packet::DEFAULT_MAX_FRAME_SIZE;
use crate::MAX_SERVICE_WRITE;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Pause between socket polls
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,

    /// Bytes requested per socket read
    #[serde(default = "default_read_buffer")]
    pub read_buffer_size: usize,

    /// Frames above this length close the channel
    #[serde(default = "default_max_frame")]
    pub max_frame_size: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default)]
    pub standard: CryptoStandard,

    /// Modulus size for Diffie-Hellman, in bytes
    #[serde(default = "default_dh_bytes")]
    pub dh_byte_size: usize,

    /// Host-side key rotation cadence
    #[serde(default = "default_rotation")]
    pub rotation_interval_secs: u64,

    /// Grace period for the first key to arrive
    #[serde(default = "default_key_timeout")]
    pub key_timeout_secs: u64,

    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service payloads above this size are dropped
    #[serde(default = "default_max_write")]
    pub max_write_size: usize,

    /// Envelope bytes handed to the crypto manager per tick
    #[serde(default = "default_max_write")]
    pub max_flush_size: usize,

    /// Delay between a blacklist decision and the disconnect
    #[serde(default = "default_grace")]
    pub blacklist_grace_secs: u64,

    #[serde(default = "default_true")]
    pub permit_service_add: bool,

    /// Blacklist greeted peers that are not known connection entities
    #[serde(default)]
    pub require_authentication: bool,

    #[serde(default)]
    pub allow_registration: bool,

    #[serde(default = "default_retries")]
    pub max_retries: u16,

    /// Name reported to greeted peers
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,

    #[serde(default = "default_tick_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_tick_ms() -> u64 { 1 }
fn default_read_buffer() -> usize { 64 * 1024 }
fn default_max_frame() -> usize { DEFAULT_MAX_FRAME_SIZE }
fn default_connect_timeout() -> u64 { 30 }
fn default_dh_bytes() -> usize { 64 }
fn default_rotation() -> u64 { 300 }
fn default_key_timeout() -> u64 { 10 }
fn default_max_write() -> usize { MAX_SERVICE_WRITE }
fn default_grace() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_retries() -> u16 { 3 }
fn default_server_name() -> String { "securemux".to_string() }
fn default_listen() -> String { format!("0.0.0.0:{}", crate::STANDARD_PORT) }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_ms(),
            read_buffer_size: default_read_buffer(),
            max_frame_size: default_max_frame(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            standard: CryptoStandard::default(),
            dh_byte_size: default_dh_bytes(),
            rotation_interval_secs: default_rotation(),
            key_timeout_secs: default_key_timeout(),
            tick_interval_ms: default_tick_ms(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_write_size: default_max_write(),
            max_flush_size: default_max_write(),
            blacklist_grace_secs: default_grace(),
            permit_service_add: default_true(),
            require_authentication: false,
            allow_registration: false,
            max_retries: default_retries(),
            server_name: default_server_name(),
            tick_interval_ms: default_tick_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            poll_interval_ms: default_tick_ms(),
        }
    }
}

impl TransportConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl CryptoConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn key_timeout(&self) -> Duration {
        Duration::from_secs(self.key_timeout_secs)
    }
}

impl ServiceConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn blacklist_grace(&self) -> Duration {
        Duration::from_secs(self.blacklist_grace_secs)
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

/// Load configuration from a file
pub fn load(path: &Path) -> ProtocolResult<Config> {
    let content = fs::read_to_string(path)?;

    let config: Config = if is_json(path) {
        serde_json::from_str(&content)?
    } else {
        // Assume TOML if not JSON
        toml::from_str(&content)?
    };

    Ok(config)
}

/// Save configuration to a file
pub fn save(config: &Config, path: &Path) -> ProtocolResult<()> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };

    fs::write(path, content)?;
    Ok(())
}

/// Generate a sample configuration file
pub fn generate_sample() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.crypto.dh_byte_size, 64);
        assert_eq!(config.crypto.rotation_interval(), Duration::from_secs(300));
        assert_eq!(config.crypto.key_timeout(), Duration::from_secs(10));
        assert_eq!(config.service.max_write_size, 65536);
        assert_eq!(config.crypto.standard, CryptoStandard::DiffieHellmanAes256);
        assert_eq!(config.supervisor.listen_addr, "0.0.0.0:10030");
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[crypto]\ndh_byte_size = 96\nstandard = \"None\"").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.crypto.dh_byte_size, 96);
        assert_eq!(config.crypto.standard, CryptoStandard::None);
        assert_eq!(config.crypto.key_timeout_secs, 10);
        assert!(config.service.permit_service_add);
    }

    #[test]
    fn test_load_json_config() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"service": {{"require_authentication": true}}}}"#).unwrap();

        let config = load(file.path()).unwrap();
        assert!(config.service.require_authentication);
        assert_eq!(config.service.max_retries, 3);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.transport.read_buffer_size = 4096;
        let file = NamedTempFile::with_suffix(".toml").unwrap();

        save(&config, file.path()).unwrap();
        let loaded = load(file.path()).unwrap();

        assert_eq!(loaded.transport.read_buffer_size, 4096);
    }

    #[test]
    fn test_sample_parses() {
        let sample = generate_sample();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.crypto.dh_byte_size, 64);
    }
}
