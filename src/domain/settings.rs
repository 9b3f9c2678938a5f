use crate::domain::grid::{GridLayout, LayoutPreset};
use crate::domain::models::Mode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    "tactile_nav".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Discovery, GATT and reconnection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    /// Advertised name prefix used to pick the device
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_tactile_uuid")]
    pub tactile_char_uuid: String,
    #[serde(default = "default_mode_uuid")]
    pub mode_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub status_char_uuid: String,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            service_uuid: default_service_uuid(),
            tactile_char_uuid: default_tactile_uuid(),
            mode_char_uuid: default_mode_uuid(),
            status_char_uuid: default_status_uuid(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

fn default_name_prefix() -> String {
    "TactileNav".to_string()
}
fn default_service_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::SERVICE_UUID.to_string()
}
fn default_tactile_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::TACTILE_CHAR_UUID.to_string()
}
fn default_mode_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::MODE_CHAR_UUID.to_string()
}
fn default_status_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::STATUS_CHAR_UUID.to_string()
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}

/// Full-frame refresh policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// A full frame is due once this many frames went out since the last one
    #[serde(default = "default_full_frame_interval")]
    pub full_frame_interval: u32,
    /// Changed-pin ratio above which a full frame replaces the diff
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            full_frame_interval: default_full_frame_interval(),
            diff_threshold: default_diff_threshold(),
        }
    }
}

fn default_full_frame_interval() -> u32 {
    10
}
fn default_diff_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub layout: LayoutPreset,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,

    // Tick rates
    #[serde(default = "default_fps_map")]
    pub fps_map: u32,
    #[serde(default = "default_fps_zoom")]
    pub fps_zoom: u32,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Settings {
    pub fn grid_layout(&self) -> GridLayout {
        GridLayout::from_preset(self.layout)
    }

    pub fn default_fps(&self, mode: Mode) -> u32 {
        match mode {
            Mode::Map => self.fps_map,
            Mode::Zoom => self.fps_zoom,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            layout: LayoutPreset::default(),
            ble: BleSettings::default(),
            dispatch: DispatchSettings::default(),
            fps_map: default_fps_map(),
            fps_zoom: default_fps_zoom(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_fps_map() -> u32 {
    5
}
fn default_fps_zoom() -> u32 {
    2
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::at_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults
    pub fn at_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("TactileNav");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
