//! Configuration management for the session service.
//!
//! Loads and saves the TOML configuration that tunes scanning policy,
//! RSSI polling and connection timeouts.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use, e.g. `hci0`. The system default when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Start scanning as soon as the adapter reports powered on.
   #[serde(default = "default_scan_on_power_on")]
   pub scan_on_power_on: bool,

   /// Stop the radio scan once a connection is established.
   #[serde(default)]
   pub stop_scan_on_connect: bool,

   #[serde(default = "default_rssi_poll_interval")]
   pub rssi_poll_interval_ms: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   /// Print session events as JSON lines instead of text.
   #[serde(default)]
   pub json_events: bool,
}

const fn default_scan_on_power_on() -> bool {
   true
}

const fn default_rssi_poll_interval() -> u64 {
   1000
}

const fn default_connect_timeout() -> u64 {
   30
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         scan_on_power_on: default_scan_on_power_on(),
         stop_scan_on_connect: false,
         rssi_poll_interval_ms: default_rssi_poll_interval(),
         connect_timeout_sec: default_connect_timeout(),
         json_events: false,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if the file
   /// does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(session_home) = env::var("BLE_SESSION_HOME") {
         PathBuf::from(session_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("ble-session").join("config.toml"))
   }

   pub fn session(&self) -> SessionConfig {
      SessionConfig {
         scan_on_power_on: self.scan_on_power_on,
         stop_scan_on_connect: self.stop_scan_on_connect,
         rssi_poll_interval: Duration::from_millis(self.rssi_poll_interval_ms.max(1)),
      }
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }
}

/// The subset of [`Config`] the session actor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
   pub scan_on_power_on: bool,
   pub stop_scan_on_connect: bool,
   pub rssi_poll_interval: Duration,
}

impl Default for SessionConfig {
   fn default() -> Self {
      Config::default().session()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_load_creates_default_file() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path)?;
      assert_eq!(config, Config::default());
      assert!(path.exists());

      Ok(())
   }

   #[test]
   fn test_partial_file_uses_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "stop_scan_on_connect = true\nadapter = \"hci1\"\n")?;

      let config = Config::load_from(&path)?;
      assert!(config.stop_scan_on_connect);
      assert!(config.scan_on_power_on);
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.rssi_poll_interval_ms, 1000);
      assert_eq!(config.connect_timeout(), Duration::from_secs(30));

      Ok(())
   }

   #[test]
   fn test_save_round_trip() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         rssi_poll_interval_ms: 250,
         json_events: true,
         ..Config::default()
      };
      config.save_to(&path)?;
      assert_eq!(Config::load_from(&path)?, config);

      Ok(())
   }

   #[test]
   fn test_session_config_clamps_zero_interval() {
      let config = Config {
         rssi_poll_interval_ms: 0,
         ..Config::default()
      };
      assert_eq!(
         config.session().rssi_poll_interval,
         Duration::from_millis(1)
      );
   }
}
