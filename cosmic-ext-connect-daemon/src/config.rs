//! Daemon Configuration
//!
//! Configuration management for the COSMIC Connect daemon. The file lives at
//! `$XDG_CONFIG_HOME/cosmic-ext-connect/daemon.toml`; missing keys fall back
//! to their defaults and a default file is written when none exists.
//!
//! ```toml
//! [device]
//! name = "workstation"
//! device_type = "desktop"
//!
//! [services]
//! lan = true
//!
//! [lan]
//! tcp_port = 1716
//! discovery_port = 1716
//! discovery = true
//! bind_address = "0.0.0.0"
//!
//! [dbus]
//! enabled = true
//! object_path = "/io/github/CosmicExtConnect"
//! ```

use anyhow::{Context, Result};
use cosmic_ext_connect_protocol::{DeviceType, LanConfig, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Directory name below the XDG config and data directories
const APP_DIR: &str = "cosmic-ext-connect";

const CONFIG_FILE: &str = "daemon.toml";

/// Default root of the exported object tree
pub const DEFAULT_OBJECT_PATH: &str = "/io/github/CosmicExtConnect";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local device identity
    #[serde(default)]
    pub device: DeviceConfig,

    /// Channel services by name, `true` to enable
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, bool>,

    /// LAN service settings
    #[serde(default)]
    pub lan: LanSettings,

    /// D-Bus export
    #[serde(default)]
    pub dbus: DbusConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name announced to other devices
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
}

/// LAN service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanSettings {
    /// TCP listening port
    #[serde(default = "default_port")]
    pub tcp_port: u16,

    /// UDP discovery port
    #[serde(default = "default_port")]
    pub discovery_port: u16,

    /// Announce and listen on UDP
    #[serde(default = "default_true")]
    pub discovery: bool,

    /// Address the listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

/// D-Bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base path of the exported objects
    #[serde(default = "default_object_path")]
    pub object_path: String,
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Data directory (identity and device records)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "COSMIC Computer".to_string())
}

fn default_device_type() -> DeviceType {
    DeviceType::Desktop
}

fn default_services() -> BTreeMap<String, bool> {
    BTreeMap::from([("lan".to_string(), true)])
}

fn default_port() -> u16 {
    cosmic_ext_connect_protocol::service::lan::DEFAULT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_object_path() -> String {
    DEFAULT_OBJECT_PATH.to_string()
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join(APP_DIR)
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            device_type: default_device_type(),
        }
    }
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            tcp_port: default_port(),
            discovery_port: default_port(),
            discovery: true,
            bind_address: default_bind_address(),
        }
    }
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            object_path: default_object_path(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            services: default_services(),
            lan: LanSettings::default(),
            dbus: DbusConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl Config {
    /// `daemon.toml` in the default configuration directory
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from `path`, creating a default file if not found
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        Ok(())
    }

    /// Services not listed are enabled
    pub fn is_service_enabled(&self, name: &str) -> bool {
        self.services.get(name).copied().unwrap_or(true)
    }

    pub fn set_service_enabled(&mut self, name: &str, enabled: bool) {
        self.services.insert(name.to_string(), enabled);
    }

    /// Listed services that are not among `known`
    pub fn unknown_services<'a>(&'a self, known: &[String]) -> Vec<&'a str> {
        self.services
            .keys()
            .filter(|name| !known.contains(name))
            .map(String::as_str)
            .collect()
    }

    /// Device manager settings; only `known` services are passed on
    pub fn manager_config(&self, known: &[&str]) -> ManagerConfig {
        ManagerConfig {
            device_name: self.device.name.clone(),
            device_type: self.device.device_type,
            services: self
                .services
                .iter()
                .filter(|(name, _)| known.contains(&name.as_str()))
                .map(|(name, enabled)| (name.clone(), *enabled))
                .collect(),
            ..ManagerConfig::default()
        }
    }

    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            tcp_port: self.lan.tcp_port,
            discovery_port: self.lan.discovery_port,
            discovery: self.lan.discovery,
            bind_address: self.lan.bind_address,
            ..LanConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.lan.tcp_port, 1716);
        assert_eq!(config.lan.discovery_port, 1716);
        assert!(config.lan.discovery);
        assert!(config.dbus.enabled);
        assert_eq!(config.dbus.object_path, DEFAULT_OBJECT_PATH);
        assert_eq!(config.services.get("lan"), Some(&true));
        assert!(!config.device.name.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            name = "Study"
            device_type = "laptop"

            [lan]
            discovery = false
            "#,
        )
        .unwrap();

        assert_eq!(parsed.device.name, "Study");
        assert_eq!(parsed.device.device_type, DeviceType::Laptop);
        assert!(!parsed.lan.discovery);
        assert_eq!(parsed.lan.tcp_port, 1716);
        assert!(parsed.is_service_enabled("lan"));
        assert!(parsed.dbus.enabled);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config::load(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_save_and_reload_service_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = Config::default();
        config.set_service_enabled("lan", false);
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert!(!reloaded.is_service_enabled("lan"));
        assert!(reloaded.is_service_enabled("bluetooth"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[device]\ndevice_type = \"toaster\"\n").unwrap();

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_unknown_services_are_filtered() {
        let mut config = Config::default();
        config.set_service_enabled("bluetooth", true);

        let known = vec!["lan".to_string()];
        assert_eq!(config.unknown_services(&known), vec!["bluetooth"]);

        let manager = config.manager_config(&["lan"]);
        assert_eq!(manager.services.len(), 1);
        assert!(manager.is_service_enabled("lan"));
        assert_eq!(manager.device_name, config.device.name);
    }

    #[test]
    fn test_lan_config_mapping() {
        let mut config = Config::default();
        config.lan.tcp_port = 1739;
        config.lan.discovery = false;
        config.lan.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let lan = config.lan_config();
        assert_eq!(lan.tcp_port, 1739);
        assert_eq!(lan.discovery_port, 1716);
        assert!(!lan.discovery);
        assert_eq!(lan.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
