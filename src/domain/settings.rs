use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where log output goes and how verbose it is
///
/// Console output is plain text on stderr; the rolling file also records
/// targets and source locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
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
    "dorm_door".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Protocol and transport timings, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_exact_scan_timeout_ms")]
    pub exact_scan_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_byte_delay_ms")]
    pub byte_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_post_response_disconnect_ms")]
    pub post_response_disconnect_ms: u64,
    #[serde(default = "default_notify_disconnect_ms")]
    pub notify_disconnect_ms: u64,
    #[serde(default = "default_entrance_disconnect_ms")]
    pub entrance_disconnect_ms: u64,
    #[serde(default = "default_service_settle_ms")]
    pub service_settle_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            exact_scan_timeout_ms: default_exact_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            byte_delay_ms: default_byte_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_send_attempts: default_max_send_attempts(),
            response_timeout_ms: default_response_timeout_ms(),
            post_response_disconnect_ms: default_post_response_disconnect_ms(),
            notify_disconnect_ms: default_notify_disconnect_ms(),
            entrance_disconnect_ms: default_entrance_disconnect_ms(),
            service_settle_ms: default_service_settle_ms(),
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    12_000
}
fn default_exact_scan_timeout_ms() -> u64 {
    8_000
}
fn default_connect_timeout_ms() -> u64 {
    8_000
}
fn default_byte_delay_ms() -> u64 {
    50
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_max_send_attempts() -> u32 {
    3
}
fn default_response_timeout_ms() -> u64 {
    3_000
}
fn default_post_response_disconnect_ms() -> u64 {
    1_000
}
fn default_notify_disconnect_ms() -> u64 {
    500
}
fn default_entrance_disconnect_ms() -> u64 {
    2_000
}
fn default_service_settle_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Lock BLE layout
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,
    #[serde(default = "default_device_name_prefix")]
    pub device_name_prefix: String,

    #[serde(default)]
    pub timings: TimingSettings,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ble_service_uuid: default_service_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),
            device_name_prefix: default_device_name_prefix(),
            timings: TimingSettings::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::COMMAND_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_device_name_prefix() -> String {
    protocol::DEVICE_NAME_PREFIX.to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file; a missing or unreadable file yields defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
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
        path.push("DormDoor");
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
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
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
}
