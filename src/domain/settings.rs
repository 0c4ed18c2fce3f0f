use crate::domain::models::Address;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
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
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "blue_manager".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timing and sizing knobs for the scan loop, sessions and stream radio.
///
/// Each option feeds exactly one phase, deadline or buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of the scan phase of each duty cycle
    #[serde(default = "default_scan_period_ms")]
    pub scan_period_ms: u64,
    /// Length of the idle phase; the eviction sweep runs at its start
    #[serde(default = "default_idle_period_ms")]
    pub idle_period_ms: u64,
    /// Wait after a scan failure before scanning again
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Service discovery deadline for a freshly connected session
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Registry TTL: unseen devices older than this are reported lost
    #[serde(default = "default_discovery_loss_timeout_ms")]
    pub discovery_loss_timeout_ms: u64,
    /// Read buffer for stream links
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Restart the scan phase if the radio drops the advertisement channel
    #[serde(default = "default_false")]
    pub auto_restart: bool,
    #[serde(default = "default_notification_descriptor")]
    pub notification_descriptor_uuid: Uuid,
    #[serde(default = "default_classic_service")]
    pub classic_service_uuid: Uuid,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_period_ms: default_scan_period_ms(),
            idle_period_ms: default_idle_period_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            discovery_loss_timeout_ms: default_discovery_loss_timeout_ms(),
            buffer_size: default_buffer_size(),
            auto_restart: false,
            notification_descriptor_uuid: default_notification_descriptor(),
            classic_service_uuid: default_classic_service(),
        }
    }
}

impl EngineConfig {
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_millis(self.idle_period_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn discovery_loss_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_loss_timeout_ms)
    }
}

fn default_scan_period_ms() -> u64 {
    15_000
}
fn default_idle_period_ms() -> u64 {
    1_000
}
fn default_error_backoff_ms() -> u64 {
    1_000
}
fn default_discovery_timeout_ms() -> u64 {
    15_000
}
fn default_discovery_loss_timeout_ms() -> u64 {
    5_000
}
fn default_buffer_size() -> usize {
    1024
}
fn default_notification_descriptor() -> Uuid {
    protocol::CLIENT_CHARACTERISTIC_CONFIG_UUID
}
fn default_classic_service() -> Uuid {
    protocol::SERIAL_PORT_SERVICE_UUID
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Devices the user connected to before
    #[serde(default)]
    pub known_addresses: Vec<Address>,

    // Scan filter: advertised service UUIDs, empty means everything
    #[serde(default)]
    pub filter_service_uuids: Vec<Uuid>,
    #[serde(default)]
    pub filter_name_prefix: Option<String>,

    // Serial-style peripherals reachable over TCP
    #[serde(default)]
    pub stream_peers: Vec<StreamPeerSettings>,
}

/// A stream peripheral exposed at a socket endpoint such as `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPeerSettings {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    pub endpoint: String,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults
    pub fn load_from(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BlueManager");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_address(&mut self, address: Address) -> anyhow::Result<()> {
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_duty_cycle() {
        let config = EngineConfig::default();
        assert_eq!(config.scan_period(), Duration::from_secs(15));
        assert_eq!(config.idle_period(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), Duration::from_secs(1));
        assert_eq!(config.discovery_timeout(), Duration::from_secs(15));
        assert_eq!(config.discovery_loss_timeout(), Duration::from_secs(5));
        assert_eq!(config.buffer_size, 1024);
        assert!(!config.auto_restart);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{ "engine": { "scan_period_ms": 2000 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.engine.scan_period_ms, 2000);
        assert_eq!(settings.engine.idle_period_ms, 1000);
        assert_eq!(
            settings.engine.notification_descriptor_uuid,
            protocol::CLIENT_CHARACTERISTIC_CONFIG_UUID
        );
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_stream_peers_parse() {
        let json = r#"{ "stream_peers": [ { "address": "00:11:22:33:44:55", "endpoint": "127.0.0.1:7000" } ] }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(
            settings.stream_peers,
            vec![StreamPeerSettings {
                address: Address::new("00:11:22:33:44:55"),
                name: None,
                endpoint: "127.0.0.1:7000".into(),
            }]
        );
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::load_from(dir.path().join("absent.json"));
        assert!(service.get().known_addresses.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::load_from(path.clone());
        service.get_mut().engine.discovery_timeout_ms = 5000;
        service.add_known_address(Address::new("aa:bb")).unwrap();
        // Adding twice must not duplicate
        service.add_known_address(Address::new("AA:BB")).unwrap();

        let reloaded = SettingsService::load_from(path);
        assert_eq!(reloaded.get().engine.discovery_timeout_ms, 5000);
        assert_eq!(reloaded.get().known_addresses, vec![Address::new("AA:BB")]);
    }
}
