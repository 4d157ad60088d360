//! Configuration for the manager and for individual transfers
//!
//! A [`Config`] is a plain value. Every key has a default, so missing keys in
//! a JSON document or a key/value map fall back silently, the same way an
//! invalid stored value does. Runtime changes go through [`Config::apply`],
//! which reports whether the value actually changed.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;
use tracing::debug;

use swarm_common::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};

/// Name of the directory below `data_dir` that holds resume files
pub const RESUME_DIR_NAME: &str = "resume";

/// Recognized configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ConfigKey {
    MinPort,
    MaxPort,
    Bind,
    Ip,
    SocketTimeout,
    TimeoutCheckInterval,
    MaxFilesOpen,
    MaxUploadRate,
    UploadUnitSize,
    MaxUploads,
    ForwardedPort,
    DataDir,
    CheckHashes,
    MinPeers,
    MaxConnections,
    RetaliateToGarbledData,
    FilesystemEncoding,
    ListenFailOk,
    Upnp,
}

/// Keys the manager applies at runtime
pub const MANAGER_OPTIONS: &[ConfigKey] = &[
    ConfigKey::MaxUploadRate,
    ConfigKey::UploadUnitSize,
    ConfigKey::MaxFilesOpen,
    ConfigKey::MinPort,
    ConfigKey::MaxPort,
];

/// Keys a running transfer applies at runtime
pub const TRANSFER_OPTIONS: &[ConfigKey] = &[
    ConfigKey::MaxUploadRate,
    ConfigKey::MaxUploads,
    ConfigKey::MinPeers,
    ConfigKey::MaxConnections,
    ConfigKey::RetaliateToGarbledData,
    ConfigKey::ForwardedPort,
];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("upload unit size must be greater than zero")]
    ZeroUploadUnit,

    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Manager and per-transfer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lowest port tried for the shared listener
    pub min_port: u16,
    /// Highest port tried for the shared listener
    pub max_port: u16,
    /// Local address the listener binds to
    pub bind: IpAddr,
    /// Address reported to trackers, if different from the observed one
    pub ip: Option<IpAddr>,
    /// Seconds before an idle socket is dropped
    pub socket_timeout: u64,
    /// Seconds between idle-socket sweeps
    pub timeout_check_interval: u64,
    /// Upper bound on simultaneously open files (0 = unlimited)
    pub max_files_open: usize,
    /// Upload rate limit in KiB/s (0 = unlimited)
    pub max_upload_rate: u64,
    /// Bytes sent per rate-limiter grant
    pub upload_unit_size: usize,
    /// Upload slots per transfer (0 = derive from the upload rate)
    pub max_uploads: usize,
    /// Externally forwarded port to report instead of the listen port (0 = none)
    pub forwarded_port: u16,
    /// Directory for persistent state such as resume files
    pub data_dir: Option<PathBuf>,
    /// Verify existing data against piece hashes before starting
    pub check_hashes: bool,
    /// Stop asking the tracker for peers above this many connections
    pub min_peers: usize,
    /// Hard cap on peer connections per transfer
    pub max_connections: usize,
    /// Ban peers that send data failing verification, instead of kicking them
    pub retaliate_to_garbled_data: bool,
    /// Encoding used for file names on disk
    pub filesystem_encoding: String,
    /// Continue without a listener if no port in the range can be bound
    pub listen_fail_ok: bool,
    /// Request a port mapping from a UPnP gateway
    pub upnp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ip: None,
            socket_timeout: 300,
            timeout_check_interval: 60,
            max_files_open: 50,
            max_upload_rate: 0,
            upload_unit_size: 1380,
            max_uploads: 0,
            forwarded_port: 0,
            data_dir: None,
            check_hashes: true,
            min_peers: 20,
            max_connections: 80,
            retaliate_to_garbled_data: true,
            filesystem_encoding: "utf-8".to_string(),
            listen_fail_ok: false,
            upnp: false,
        }
    }
}

impl Config {
    /// Parse a JSON document; missing keys take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build from string key/value pairs
    ///
    /// Unknown keys and unparseable values are skipped and the default kept.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        for (name, value) in map {
            let Ok(key) = ConfigKey::from_str(name) else {
                debug!(option = %name, "ignoring unknown option");
                continue;
            };
            if let Err(err) = config.apply(key, value) {
                debug!(error = %err, "ignoring invalid option, keeping default");
            }
        }
        config
    }

    /// Set one key from its string form
    ///
    /// # Returns
    /// * `Ok(true)` - The value changed
    /// * `Ok(false)` - The value parsed but was already set
    /// * `Err(ConfigError)` - The value could not be parsed
    pub fn apply(&mut self, key: ConfigKey, value: &str) -> Result<bool, ConfigError> {
        let before = self.clone();
        match key {
            ConfigKey::MinPort => self.min_port = parse(key, value)?,
            ConfigKey::MaxPort => self.max_port = parse(key, value)?,
            ConfigKey::Bind => self.bind = parse(key, value)?,
            ConfigKey::Ip => self.ip = parse_optional(key, value)?,
            ConfigKey::SocketTimeout => self.socket_timeout = parse(key, value)?,
            ConfigKey::TimeoutCheckInterval => self.timeout_check_interval = parse(key, value)?,
            ConfigKey::MaxFilesOpen => self.max_files_open = parse(key, value)?,
            ConfigKey::MaxUploadRate => self.max_upload_rate = parse(key, value)?,
            ConfigKey::UploadUnitSize => self.upload_unit_size = parse(key, value)?,
            ConfigKey::MaxUploads => self.max_uploads = parse(key, value)?,
            ConfigKey::ForwardedPort => self.forwarded_port = parse(key, value)?,
            ConfigKey::DataDir => self.data_dir = parse_optional(key, value)?,
            ConfigKey::CheckHashes => self.check_hashes = parse_bool(key, value)?,
            ConfigKey::MinPeers => self.min_peers = parse(key, value)?,
            ConfigKey::MaxConnections => self.max_connections = parse(key, value)?,
            ConfigKey::RetaliateToGarbledData => {
                self.retaliate_to_garbled_data = parse_bool(key, value)?
            }
            ConfigKey::FilesystemEncoding => self.filesystem_encoding = value.trim().to_string(),
            ConfigKey::ListenFailOk => self.listen_fail_ok = parse_bool(key, value)?,
            ConfigKey::Upnp => self.upnp = parse_bool(key, value)?,
        }
        Ok(*self != before)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_port > self.max_port || self.min_port == 0 {
            return Err(ConfigError::InvalidPortRange {
                min: self.min_port,
                max: self.max_port,
            });
        }
        if self.upload_unit_size == 0 {
            return Err(ConfigError::ZeroUploadUnit);
        }
        Ok(())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval)
    }

    /// Directory holding resume files, if persistent state is enabled
    pub fn resume_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(RESUME_DIR_NAME))
    }
}

fn invalid(key: ConfigKey, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.as_ref().to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: ConfigKey, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Empty string clears the value
fn parse_optional<T: FromStr>(key: ConfigKey, value: &str) -> Result<Option<T>, ConfigError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse(key, value).map(Some)
}

fn parse_bool(key: ConfigKey, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_port, 6881);
        assert_eq!(config.max_port, 6999);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_key_names_are_snake_case() {
        assert_eq!(ConfigKey::MaxUploadRate.as_ref(), "max_upload_rate");
        assert_eq!(
            ConfigKey::from_str("retaliate_to_garbled_data").unwrap(),
            ConfigKey::RetaliateToGarbledData
        );
        assert!(ConfigKey::from_str("no_such_key").is_err());
    }

    #[test]
    fn test_every_key_round_trips_through_its_name() {
        for key in ConfigKey::iter() {
            assert_eq!(ConfigKey::from_str(key.as_ref()).unwrap(), key);
        }
    }

    #[test]
    fn test_apply_reports_change() {
        let mut config = Config::default();
        assert!(config.apply(ConfigKey::MaxUploadRate, "20").unwrap());
        assert_eq!(config.max_upload_rate, 20);
        assert!(!config.apply(ConfigKey::MaxUploadRate, "20").unwrap());
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let mut config = Config::default();
        assert!(config.apply(ConfigKey::MinPort, "port").is_err());
        assert!(config.apply(ConfigKey::CheckHashes, "maybe").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_apply_optional_values() {
        let mut config = Config::default();
        assert!(config.apply(ConfigKey::DataDir, "/var/lib/swarm").unwrap());
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/swarm")));
        assert!(config.apply(ConfigKey::DataDir, "").unwrap());
        assert!(config.data_dir.is_none());

        assert!(config.apply(ConfigKey::Ip, "10.0.0.5").unwrap());
        assert!(config.apply(ConfigKey::Ip, "not-an-ip").is_err());
    }

    #[test]
    fn test_from_map_skips_invalid_and_unknown() {
        let mut map = HashMap::new();
        map.insert("max_uploads".to_string(), "4".to_string());
        map.insert("min_port".to_string(), "abc".to_string());
        map.insert("favourite_colour".to_string(), "blue".to_string());

        let config = Config::from_map(&map);
        assert_eq!(config.max_uploads, 4);
        assert_eq!(config.min_port, DEFAULT_MIN_PORT);
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(r#"{"max_port": 7000, "check_hashes": false}"#).unwrap();
        assert_eq!(config.max_port, 7000);
        assert!(!config.check_hashes);
        assert_eq!(config.min_port, DEFAULT_MIN_PORT);
    }

    #[test]
    fn test_validate_port_range() {
        let config = Config {
            min_port: 7000,
            max_port: 6000,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange { min: 7000, max: 6000 })
        ));
    }

    #[test]
    fn test_resume_dir() {
        let config = Config {
            data_dir: Some(PathBuf::from("/data")),
            ..Config::default()
        };
        assert_eq!(config.resume_dir(), Some(PathBuf::from("/data/resume")));
        assert!(Config::default().resume_dir().is_none());
    }

    #[test]
    fn test_option_allow_lists() {
        assert!(MANAGER_OPTIONS.contains(&ConfigKey::MinPort));
        assert!(!MANAGER_OPTIONS.contains(&ConfigKey::MaxUploads));
        assert!(TRANSFER_OPTIONS.contains(&ConfigKey::ForwardedPort));
        assert!(!TRANSFER_OPTIONS.contains(&ConfigKey::DataDir));
    }
}
