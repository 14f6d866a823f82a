use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::infrastructure::crypto::KEY_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default)]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: false,
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "danfoss_eco".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Per-device driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Configured device name; also keys the persisted secret-key slot.
    #[serde(default = "default_name")]
    pub name: String,

    /// Numeric PIN written on every connection. The factory default is
    /// "0000".
    #[serde(default = "default_pin")]
    pub pin_code: String,

    /// Secret key as 32 hex chars. Leave unset to learn the key from the
    /// device while its hardware button is pressed.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Seconds between periodic update cycles scheduled by the host.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Directory for persisted driver state. Defaults to the platform
    /// config dir.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            pin_code: default_pin(),
            secret_key: None,
            update_interval_secs: default_update_interval(),
            state_dir: None,
            log_settings: LogSettings::default(),
        }
    }
}

fn default_name() -> String {
    "eTRV".to_string()
}
fn default_pin() -> String {
    "0000".to_string()
}
fn default_update_interval() -> u64 {
    60
}

/// Parse a configured secret key (32 hex chars) into raw key bytes.
pub fn parse_secret_key(value: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(value.trim())?;
    if bytes.len() != KEY_LEN {
        anyhow::bail!(
            "secret key must be exactly {} bytes (32 hex chars), got {}",
            KEY_LEN,
            bytes.len()
        );
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Loads and saves [`DeviceConfig`] as JSON under the platform config dir.
pub struct ConfigService {
    config: DeviceConfig,
    config_path: PathBuf,
}

impl ConfigService {
    pub fn new() -> anyhow::Result<Self> {
        let config_path = Self::get_config_path()?;
        let config = Self::load_from_file(&config_path).unwrap_or_default();

        Ok(Self {
            config,
            config_path,
        })
    }

    fn get_config_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("danfoss-eco");
        fs::create_dir_all(&path)?;
        path.push("config.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<DeviceConfig> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.config_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    secret_key: String,
}

/// Persistence for the one secret-key blob the driver owns.
///
/// The slot file is named by a digest of the configured device name, so two
/// thermostats driven from the same host store their keys independently.
pub struct SecretKeyStore {
    path: PathBuf,
}

impl SecretKeyStore {
    pub fn new(device_name: &str, state_dir: Option<&PathBuf>) -> anyhow::Result<Self> {
        let mut path = match state_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut path = dirs::config_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
                path.push("danfoss-eco");
                path
            }
        };
        fs::create_dir_all(&path)?;

        let digest = Sha256::digest(device_name.as_bytes());
        path.push(format!("key-{}.json", hex::encode(&digest[..8])));
        Ok(Self { path })
    }

    /// Previously learned key, if any. A malformed slot file is treated as
    /// absent rather than an error.
    pub fn load(&self) -> Option<[u8; KEY_LEN]> {
        let contents = fs::read_to_string(&self.path).ok()?;
        let stored: StoredKey = match serde_json::from_str(&contents) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("ignoring malformed key store {:?}: {e}", self.path);
                return None;
            }
        };
        match parse_secret_key(&stored.secret_key) {
            Ok(key) => {
                debug!("loaded secret key from {:?}", self.path);
                Some(key)
            }
            Err(e) => {
                warn!("ignoring malformed key store {:?}: {e}", self.path);
                None
            }
        }
    }

    pub fn save(&self, key: &[u8; KEY_LEN]) -> anyhow::Result<()> {
        let stored = StoredKey {
            secret_key: hex::encode(key),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        fs::write(&self.path, json)?;
        debug!("saved secret key to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("danfoss-eco-test-{tag}-{}", std::process::id()));
        dir
    }

    #[test]
    fn test_parse_secret_key() {
        let key = parse_secret_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0f);

        assert!(parse_secret_key("0011").is_err());
        assert!(parse_secret_key("zz0102030405060708090a0b0c0d0e0f").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: DeviceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pin_code, "0000");
        assert_eq!(config.update_interval_secs, 60);
        assert!(config.secret_key.is_none());
        assert_eq!(config.log_settings.level, "info");
    }

    #[test]
    fn test_key_store_round_trip() {
        let dir = temp_state_dir("round-trip");
        let _ = fs::remove_dir_all(&dir);
        let store = SecretKeyStore::new("Living Room", Some(&dir)).unwrap();

        assert!(store.load().is_none());

        let key = [0xA5u8; KEY_LEN];
        store.save(&key).unwrap();
        assert_eq!(store.load(), Some(key));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_key_store_slots_are_per_device() {
        let dir = temp_state_dir("slots");
        let _ = fs::remove_dir_all(&dir);
        let a = SecretKeyStore::new("Living Room", Some(&dir)).unwrap();
        let b = SecretKeyStore::new("Bedroom", Some(&dir)).unwrap();

        a.save(&[0x01; KEY_LEN]).unwrap();
        assert!(b.load().is_none());
        assert_eq!(a.load(), Some([0x01; KEY_LEN]));

        fs::remove_dir_all(&dir).unwrap();
    }
}
