use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const APP_DIR_NAME: &str = "droiddock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    /// Discovery poll interval in seconds.
    pub poll_interval_secs: u64,
    pub auto_start_monitoring: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            auto_start_monitoring: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
    pub log_to_file: bool,
    /// Empty means the platform default directory.
    pub log_dir: String,
    pub file_prefix: String,
    pub memory_capacity: usize,
    pub max_log_files: usize,
    pub log_file_size_mb: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            log_to_file: true,
            log_dir: String::new(),
            file_prefix: APP_DIR_NAME.to_string(),
            memory_capacity: 1000,
            max_log_files: 10,
            log_file_size_mb: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    /// Explicit path to the device bridge binary; empty resolves via
    /// PATH and conventional install locations.
    pub bridge_path: String,
    pub bootloader_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupSettings {
    /// Empty means the platform default data directory.
    pub output_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub version: String,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDDOCK_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".droiddock_config.json")
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(validate_config(AppConfig::default()));
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), trace_id)
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create config dir: {err}"), trace_id)
            })?;
        }
    }
    let json = serde_json::to_string_pretty(&validate_config(config.clone()))
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, json)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

/// Clamps out-of-range values instead of rejecting the file, so a hand
/// edited config degrades to something sane.
pub fn validate_config(mut config: AppConfig) -> AppConfig {
    config.device.poll_interval_secs = config.device.poll_interval_secs.clamp(1, 3600);
    config.logging.memory_capacity = config.logging.memory_capacity.clamp(10, 100_000);
    config.logging.max_log_files = config.logging.max_log_files.clamp(1, 1000);
    config.logging.log_file_size_mb = config.logging.log_file_size_mb.clamp(1, 1024);
    if config.logging.file_prefix.trim().is_empty() {
        config.logging.file_prefix = APP_DIR_NAME.to_string();
    }
    let level = config.logging.log_level.trim().to_uppercase();
    config.logging.log_level = match level.as_str() {
        "DEBUG" | "INFO" | "WARN" | "ERROR" | "FATAL" => level,
        _ => "INFO".to_string(),
    };
    if config.version.is_empty() {
        config.version = env!("CARGO_PKG_VERSION").to_string();
    }
    config
}

/// Directory for the structured log files.
pub fn log_dir(config: &AppConfig) -> PathBuf {
    let configured = config.logging.log_dir.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("logs")
}

/// Directory where device backups land.
pub fn backup_dir(config: &AppConfig) -> PathBuf {
    let configured = config.backup.output_dir.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("backups")
}
