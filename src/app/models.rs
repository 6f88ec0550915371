use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State reported by the bridge tool for an attached device. Only
/// `Online` devices enter the registry; the rest are logged and skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Recovery,
    Bootloader,
    Offline,
    Unauthorized,
}

impl DeviceState {
    /// Maps the second column of the bridge tool's device list. The tool
    /// reports a ready device as `device`; a flashing-mode device shows
    /// up as `bootloader` (or `fastboot` in the bootloader tool's list).
    pub fn from_token(token: &str) -> Self {
        match token {
            "device" => DeviceState::Online,
            "recovery" => DeviceState::Recovery,
            "bootloader" | "fastboot" => DeviceState::Bootloader,
            "unauthorized" | "no" => DeviceState::Unauthorized,
            _ => DeviceState::Offline,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, DeviceState::Online)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Recovery => "recovery",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
        }
    }
}

/// One physically attached device as reported by the bridge tool.
/// Rebuilt from tool output on every discovery poll; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub serial: String,
    pub state: DeviceState,
    pub model: String,
    pub manufacturer: String,
    pub android_version: String,
    pub connected: bool,
}

impl DeviceRecord {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            model: UNKNOWN.to_string(),
            manufacturer: UNKNOWN.to_string(),
            android_version: UNKNOWN.to_string(),
            connected: state.is_ready(),
        }
    }
}

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatteryInfo {
    pub level: Option<u8>,
    pub status: Option<String>,
}

/// Registry record plus the extended properties resolved on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceExtendedInfo {
    pub record: DeviceRecord,
    pub battery: BatteryInfo,
    pub build_properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellCommandResult {
    pub serial: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Generic outcome for single-invocation operations (reboot, uninstall,
/// restore, ...) where the caller mostly wants the flag and raw output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleOutcome {
    pub serial: String,
    pub success: bool,
    pub message: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RebootMode {
    Normal,
    Bootloader,
    Recovery,
}

impl RebootMode {
    pub fn arg(self) -> Option<&'static str> {
        match self {
            RebootMode::Normal => None,
            RebootMode::Bootloader => Some("bootloader"),
            RebootMode::Recovery => Some("recovery"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PackageScope {
    All,
    System,
    ThirdParty,
}

impl PackageScope {
    pub fn flag(self) -> Option<&'static str> {
        match self {
            PackageScope::All => None,
            PackageScope::System => Some("-s"),
            PackageScope::ThirdParty => Some("-3"),
        }
    }
}

/// Failure codes the package manager reports in its raw install output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallErrorCode {
    Success,
    AlreadyExists,
    UpdateIncompatible,
    VersionDowngrade,
    OlderSdk,
    NewerSdk,
    InsufficientStorage,
    NotApk,
    NoMatchingAbis,
    TestOnly,
    Aborted,
    Unknown,
}

impl InstallErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            InstallErrorCode::Success => "SUCCESS",
            InstallErrorCode::AlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            InstallErrorCode::UpdateIncompatible => "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
            InstallErrorCode::VersionDowngrade => "INSTALL_FAILED_VERSION_DOWNGRADE",
            InstallErrorCode::OlderSdk => "INSTALL_FAILED_OLDER_SDK",
            InstallErrorCode::NewerSdk => "INSTALL_FAILED_NEWER_SDK",
            InstallErrorCode::InsufficientStorage => "INSTALL_FAILED_INSUFFICIENT_STORAGE",
            InstallErrorCode::NotApk => "INSTALL_PARSE_FAILED_NOT_APK",
            InstallErrorCode::NoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
            InstallErrorCode::TestOnly => "INSTALL_FAILED_TEST_ONLY",
            InstallErrorCode::Aborted => "INSTALL_FAILED_ABORTED",
            InstallErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn from_output(output: &str) -> Self {
        if output.trim().is_empty() {
            return InstallErrorCode::Unknown;
        }
        let upper = output.to_uppercase();
        if upper.contains("SUCCESS") {
            return InstallErrorCode::Success;
        }
        for code in [
            InstallErrorCode::AlreadyExists,
            InstallErrorCode::UpdateIncompatible,
            InstallErrorCode::VersionDowngrade,
            InstallErrorCode::OlderSdk,
            InstallErrorCode::NewerSdk,
            InstallErrorCode::InsufficientStorage,
            InstallErrorCode::NotApk,
            InstallErrorCode::NoMatchingAbis,
            InstallErrorCode::TestOnly,
            InstallErrorCode::Aborted,
        ] {
            if upper.contains(code.code()) {
                return code;
            }
        }
        InstallErrorCode::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallOutcome {
    pub serial: String,
    pub success: bool,
    pub error_code: InstallErrorCode,
    pub raw_output: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupOptions {
    pub include_apk: bool,
    pub include_obb: bool,
    pub include_shared: bool,
    pub include_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupResult {
    pub serial: String,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenshotCapture {
    pub serial: String,
    pub data_url: String,
    pub byte_count: usize,
}

/// Availability probe result for one external tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    FactoryReset,
    Reboot,
    ClearCache,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::FactoryReset => "factory-reset",
            OperationKind::Reboot => "reboot",
            OperationKind::ClearCache => "clear-cache",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Starting,
    Running,
    Succeeded,
    Failed,
}

/// One in-flight high-risk operation. Created when the request is
/// accepted, removed when it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRecord {
    pub serial: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub progress: Option<u8>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationSummary {
    pub serial: String,
    pub kind: OperationKind,
    pub success: bool,
    pub message: String,
    pub steps: Vec<StepOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootloaderDevice {
    pub serial: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootloaderVars {
    pub serial: String,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub reported_serial: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}
