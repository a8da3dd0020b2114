use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub trace_packets: TracePacketsConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub max_players: usize,
    pub max_concurrent_connects: usize,
    pub inactivity_timeout_ms: u64,
    pub force_ordering_for_all: bool,
    pub enable_edu: bool,
    pub enable_query: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TracePacketsConfig {
    pub include: Vec<u8>,
    pub exclude: Vec<u8>,
    pub verbosity: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 19132,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Jade".to_string(),
            max_players: 1000,
            max_concurrent_connects: 1000,
            inactivity_timeout_ms: 8500,
            force_ordering_for_all: false,
            enable_edu: false,
            enable_query: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if IpAddr::from_str(&self.network.ip).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid bind address: '{}'",
                self.network.ip
            )));
        }
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server name cannot be empty".to_string(),
            ));
        }
        if self.server.max_players == 0 {
            return Err(ConfigError::Validation(
                "maximum players must be greater than 0".to_string(),
            ));
        }
        if self.trace_packets.verbosity > 2 {
            return Err(ConfigError::Validation(format!(
                "trace verbosity must be 0..=2, got {}",
                self.trace_packets.verbosity
            )));
        }
        Ok(())
    }

    /// Maps the file-backed options onto the transport's configuration.
    pub fn transport_config(&self) -> Result<rakjade::ServerConfig> {
        let ip = IpAddr::from_str(&self.network.ip)
            .map_err(|_| ConfigError::Validation(format!("invalid bind address: '{}'", self.network.ip)))?;
        Ok(rakjade::ServerConfig {
            ip,
            port: self.network.port,
            max_players: self.server.max_players,
            max_concurrent_connects: self.server.max_concurrent_connects,
            inactivity_timeout: Duration::from_millis(self.server.inactivity_timeout_ms),
            force_ordering_for_all: self.server.force_ordering_for_all,
            enable_edu: self.server.enable_edu,
            enable_query: self.server.enable_query,
            trace_packets: rakjade::PacketTraceConfig {
                include: self.trace_packets.include.clone(),
                exclude: self.trace_packets.exclude.clone(),
                verbosity: self.trace_packets.verbosity,
            },
            ..rakjade::ServerConfig::default()
        })
    }
}

/// Loads `config.toml` from the working directory, writing the defaults out
/// on first run.
pub fn handle() -> Result<Config> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<()> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let transport = config.transport_config().unwrap();
        assert_eq!(transport.port, 19132);
        assert_eq!(transport.max_players, 1000);
        assert_eq!(transport.inactivity_timeout, Duration::from_millis(8500));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.network.port, config.network.port);
        assert_eq!(parsed.server.max_players, config.server.max_players);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: Config = toml::from_str("[network]\nip = \"127.0.0.1\"\nport = 20000\n").unwrap();
        assert_eq!(parsed.network.port, 20000);
        assert_eq!(parsed.server.max_players, 1000);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.network.ip = "not-an-ip".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.max_players = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trace_packets.verbosity = 3;
        assert!(config.validate().is_err());
    }
}
