//! Daemon Configuration
//!
//! Configuration management for the AeroPoint daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identity
    pub device: DeviceConfig,

    /// Transport configuration
    #[serde(default)]
    pub transports: TransportsConfig,

    /// Receiver-side reconstruction configuration
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name shown to peers
    pub name: String,

    /// Device ID (auto-generated and persisted if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Transport configuration
///
/// Configure which transport channels the daemon brings up. All enabled
/// channels advertise/listen concurrently; the active-source rule keeps
/// them from fighting over the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Enable the mesh-peer transport (UDP identity broadcast + TCP session)
    #[serde(default = "default_true")]
    pub enable_mesh: bool,

    /// Enable the local-network transport (mDNS + UDP datagrams)
    #[serde(default = "default_true")]
    pub enable_lan: bool,

    /// Enable the local-radio transport (Bluetooth RFCOMM)
    #[serde(default = "default_false")]
    pub enable_radio: bool,

    /// Idle timeout for datagram sessions, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Motion reconstruction policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum PolicyConfig {
    /// Apply each delta immediately
    Direct,
    /// Accumulate deltas and drain them at a fixed tick with smoothing
    #[default]
    Interpolate,
}

/// Receiver-side reconstruction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Reconstruction policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Output bounds width in pixels
    #[serde(default = "default_screen_width")]
    pub screen_width: f64,

    /// Output bounds height in pixels
    #[serde(default = "default_screen_height")]
    pub screen_height: f64,

    /// Smoothing factor for the interpolating policy
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Velocity threshold below which the pointer holds still
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Interpolation tick rate in Hz
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f64,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory
    pub data_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_screen_width() -> f64 {
    1920.0
}

fn default_screen_height() -> f64 {
    1080.0
}

fn default_alpha() -> f64 {
    aeropoint_protocol::DEFAULT_ALPHA
}

fn default_epsilon() -> f64 {
    aeropoint_protocol::DEFAULT_EPSILON
}

fn default_tick_hz() -> f64 {
    aeropoint_protocol::DEFAULT_TICK_HZ
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            // network transports enabled by default
            enable_mesh: true,
            enable_lan: true,
            // bluetooth is opt-in
            enable_radio: false,
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
            alpha: default_alpha(),
            epsilon: default_epsilon(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl TransportsConfig {
    /// Get datagram idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("aeropoint");

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("aeropoint");

        Self {
            device: DeviceConfig {
                name: format!(
                    "AP-{}",
                    hostname::get()
                        .ok()
                        .and_then(|h| h.into_string().ok())
                        .unwrap_or_else(|| "Unknown Device".to_string())
                ),
                device_id: None,
            },
            transports: TransportsConfig::default(),
            receiver: ReceiverConfig::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if not found
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("aeropoint");

        let config_path = config_dir.join("daemon.toml");

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;

        let config_path = self.paths.config_dir.join("daemon.toml");
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Get the device ID file path (for persisting auto-generated device IDs)
    pub fn device_id_path(&self) -> PathBuf {
        self.paths.data_dir.join("device_id")
    }

    /// Load the device ID, preferring the config file over the saved file
    pub fn load_device_id(&self) -> Option<String> {
        if let Some(ref id) = self.device.device_id {
            return Some(id.clone());
        }

        let device_id_path = self.device_id_path();
        if device_id_path.exists() {
            if let Ok(id) = fs::read_to_string(&device_id_path) {
                let id = id.trim().to_string();
                if !id.is_empty() {
                    tracing::info!("Loaded device ID from {}", device_id_path.display());
                    return Some(id);
                }
            }
        }

        None
    }

    /// Save a generated device ID to file
    pub fn save_device_id(&self, device_id: &str) -> Result<()> {
        let device_id_path = self.device_id_path();

        if let Some(parent) = device_id_path.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        fs::write(&device_id_path, device_id).context("Failed to save device ID")?;
        tracing::info!("Saved device ID to {}", device_id_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.transports.enable_mesh);
        assert!(config.transports.enable_lan);
        assert!(!config.transports.enable_radio);
        assert_eq!(config.receiver.policy, PolicyConfig::Interpolate);
        assert_eq!(config.receiver.screen_width, 1920.0);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.receiver.alpha, config.receiver.alpha);
        assert_eq!(parsed.transports.enable_radio, config.transports.enable_radio);
    }

    #[test]
    fn test_policy_names() {
        let direct: PolicyConfig = toml::from_str::<ReceiverConfig>("policy = \"direct\"")
            .unwrap()
            .policy;
        assert_eq!(direct, PolicyConfig::Direct);

        let interp: PolicyConfig = toml::from_str::<ReceiverConfig>("policy = \"interpolate\"")
            .unwrap()
            .policy;
        assert_eq!(interp, PolicyConfig::Interpolate);
    }

    #[test]
    fn test_idle_timeout_conversion() {
        let transports = TransportsConfig::default();
        assert_eq!(transports.idle_timeout(), Duration::from_secs(10));
    }
}
