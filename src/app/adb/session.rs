use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::app::adb::parse::parse_package_list;
use crate::app::adb::registry::DeviceRegistry;
use crate::app::error::AppError;
use crate::app::models::{
    BackupOptions, BackupResult, DeviceRecord, InstallErrorCode, InstallOutcome, PackageScope,
    RebootMode, ScreenshotCapture, ShellCommandResult, SimpleOutcome,
};
use crate::app::tools::runner::{
    ensure_success, run_tool, run_tool_with_timeout, LONG_TIMEOUT,
};
use std::time::Duration;

/// Stripped from shell commands before they reach the device. A narrow
/// safety measure against host-side chaining, not a sandbox.
pub const SHELL_METACHARACTERS: [char; 5] = [';', '&', '|', '`', '$'];

/// Substrings refused outright. Deliberately short: the metacharacter
/// strip is the primary guard.
pub const SHELL_DENYLIST: &[&str] = &["mkfs", "dd of=/dev/block", "wipe-data"];

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

pub fn sanitize_shell_command(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !SHELL_METACHARACTERS.contains(ch))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keeps serials usable as file name components.
pub fn sanitize_filename_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_registered(
    registry: &DeviceRegistry,
    serial: &str,
    trace_id: &str,
) -> Result<DeviceRecord, AppError> {
    registry.get(serial).ok_or_else(|| {
        AppError::device_not_found(format!("Device {serial} is not connected"), trace_id)
    })
}

fn require_program<'a>(program: Option<&'a str>, trace_id: &str) -> Result<&'a str, AppError> {
    program.ok_or_else(|| {
        AppError::tool_unavailable("Device bridge tool is not installed", trace_id)
    })
}

pub fn reboot_args(serial: &str, mode: RebootMode) -> Vec<String> {
    let mut built = vec!["-s".to_string(), serial.to_string(), "reboot".to_string()];
    if let Some(target) = mode.arg() {
        built.push(target.to_string());
    }
    built
}

pub fn reboot(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    mode: RebootMode,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;
    let output = run_tool(program, &reboot_args(serial, mode), trace_id)?;
    let output = ensure_success(output, "Reboot", trace_id)?;
    let message = match mode.arg() {
        Some(target) => format!("Device rebooting to {target}"),
        None => "Device rebooting".to_string(),
    };
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success: true,
        message,
        output: output.stdout.trim().to_string(),
    })
}

/// Runs one shell command on the device: denylist check, metacharacter
/// strip, fixed 30 s timeout. Non-zero exits are command errors with
/// stderr attached.
pub fn run_shell(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    command: &str,
    trace_id: &str,
) -> Result<ShellCommandResult, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;

    if command.trim().is_empty() {
        return Err(AppError::validation("Shell command is empty", trace_id));
    }
    for blocked in SHELL_DENYLIST {
        if command.contains(blocked) {
            return Err(AppError::validation(
                format!("Shell command contains blocked sequence '{blocked}'"),
                trace_id,
            ));
        }
    }
    let sanitized = sanitize_shell_command(command);
    if sanitized.is_empty() {
        return Err(AppError::validation(
            "Shell command is empty after sanitizing",
            trace_id,
        ));
    }

    let shell_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        sanitized,
    ];
    let output = run_tool(program, &shell_args, trace_id)?;
    let output = ensure_success(output, "Shell command", trace_id)?;
    Ok(ShellCommandResult {
        serial: serial.to_string(),
        stdout: output.stdout.trim().to_string(),
        stderr: output.stderr.trim().to_string(),
        exit_code: output.exit_code,
    })
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn png_bytes_to_data_url(bytes: &[u8]) -> Result<String, String> {
    if bytes.len() < PNG_SIGNATURE.len() {
        return Err("Screenshot data is empty".to_string());
    }
    if !bytes.starts_with(PNG_SIGNATURE) {
        return Err("Screenshot data is not a PNG".to_string());
    }
    let encoded = STANDARD.encode(bytes);
    Ok(format!("data:image/png;base64,{encoded}"))
}

/// Capture on device, pull to a host staging dir, remove the on-device
/// artifact. Cleanup of both sides is best-effort, not transactional: a
/// failed pull still attempts the device-side removal and the staging
/// dir always deletes itself.
pub fn capture_screenshot(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    trace_id: &str,
) -> Result<ScreenshotCapture, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;

    let device_path = format!("/sdcard/screenshot-{}.png", Utc::now().timestamp_millis());
    let staging = tempfile::TempDir::new()
        .map_err(|err| AppError::system(format!("Failed to create staging dir: {err}"), trace_id))?;
    let host_path = staging.path().join("screenshot.png");

    let capture_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "screencap".to_string(),
        "-p".to_string(),
        device_path.clone(),
    ];
    let capture = run_tool(program, &capture_args, trace_id)
        .and_then(|output| ensure_success(output, "Screenshot capture", trace_id));
    if let Err(err) = capture {
        remove_device_file(program, serial, &device_path, trace_id);
        return Err(err);
    }

    let pull_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "pull".to_string(),
        device_path.clone(),
        host_path.to_string_lossy().to_string(),
    ];
    let pulled = run_tool(program, &pull_args, trace_id)
        .and_then(|output| ensure_success(output, "Screenshot pull", trace_id))
        .and_then(|_| {
            fs::read(&host_path).map_err(|err| {
                AppError::system(format!("Failed to read pulled screenshot: {err}"), trace_id)
            })
        });
    remove_device_file(program, serial, &device_path, trace_id);

    let bytes = pulled?;
    let data_url = png_bytes_to_data_url(&bytes)
        .map_err(|reason| AppError::command(reason, trace_id))?;
    Ok(ScreenshotCapture {
        serial: serial.to_string(),
        data_url,
        byte_count: bytes.len(),
    })
}

fn remove_device_file(program: &str, serial: &str, device_path: &str, trace_id: &str) {
    let rm_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "rm".to_string(),
        device_path.to_string(),
    ];
    if let Err(err) = run_tool(program, &rm_args, trace_id) {
        warn!(
            trace_id = %trace_id,
            serial = %serial,
            error = %err.error,
            "failed to remove device-side screenshot"
        );
    }
}

/// Installs an APK with replace semantics. A tool-reported failure is a
/// structured unsuccessful outcome (the decoded code and raw output are
/// the payload); only spawn failures and timeouts are errors.
pub fn install_package(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    apk_path: &str,
    trace_id: &str,
) -> Result<InstallOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;
    if !Path::new(apk_path).is_file() {
        return Err(AppError::validation(
            format!("APK not found: {apk_path}"),
            trace_id,
        ));
    }

    let install_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "install".to_string(),
        "-r".to_string(),
        apk_path.to_string(),
    ];
    let output = run_tool_with_timeout(program, &install_args, INSTALL_TIMEOUT, trace_id)?;
    let raw_output = output.combined().trim().to_string();
    let error_code = InstallErrorCode::from_output(&raw_output);
    Ok(InstallOutcome {
        serial: serial.to_string(),
        success: output.success() && error_code == InstallErrorCode::Success,
        error_code,
        raw_output,
    })
}

pub fn uninstall_package(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    package: &str,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;
    validate_package_name(package, trace_id)?;

    let uninstall_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "uninstall".to_string(),
        package.to_string(),
    ];
    let output = run_tool(program, &uninstall_args, trace_id)?;
    let success = output.success() && output.stdout.contains("Success");
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success,
        message: if success {
            format!("Uninstalled {package}")
        } else {
            format!("Failed to uninstall {package}")
        },
        output: output.combined().trim().to_string(),
    })
}

pub fn list_packages(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    scope: PackageScope,
    trace_id: &str,
) -> Result<Vec<String>, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;

    let mut list_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "pm".to_string(),
        "list".to_string(),
        "packages".to_string(),
    ];
    if let Some(flag) = scope.flag() {
        list_args.push(flag.to_string());
    }
    let output = run_tool(program, &list_args, trace_id)?;
    let output = ensure_success(output, "Package listing", trace_id)?;
    Ok(parse_package_list(&output.stdout))
}

pub fn clear_package_data(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    package: &str,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;
    validate_package_name(package, trace_id)?;

    let clear_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "pm".to_string(),
        "clear".to_string(),
        package.to_string(),
    ];
    let output = run_tool(program, &clear_args, trace_id)?;
    let success = output.success() && output.stdout.contains("Success");
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success,
        message: if success {
            format!("Cleared data for {package}")
        } else {
            format!("Failed to clear data for {package}")
        },
        output: output.combined().trim().to_string(),
    })
}

pub fn set_developer_mode(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    enabled: bool,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;

    let value = if enabled { "1" } else { "0" };
    let settings_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "settings".to_string(),
        "put".to_string(),
        "global".to_string(),
        "development_settings_enabled".to_string(),
        value.to_string(),
    ];
    let output = run_tool(program, &settings_args, trace_id)?;
    let output = ensure_success(output, "Developer mode toggle", trace_id)?;
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success: true,
        message: format!(
            "Developer mode {}",
            if enabled { "enabled" } else { "disabled" }
        ),
        output: output.stdout.trim().to_string(),
    })
}

pub fn backup_args(serial: &str, output_path: &str, options: BackupOptions) -> Vec<String> {
    let mut built = vec![
        "-s".to_string(),
        serial.to_string(),
        "backup".to_string(),
        "-f".to_string(),
        output_path.to_string(),
    ];
    if options.include_apk {
        built.push("-apk".to_string());
    }
    if options.include_obb {
        built.push("-obb".to_string());
    }
    if options.include_shared {
        built.push("-shared".to_string());
    }
    built.push(if options.include_system {
        "-system".to_string()
    } else {
        "-nosystem".to_string()
    });
    built.push("-all".to_string());
    built
}

/// Long-running full-device backup into the configured backup dir.
pub fn create_backup(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    options: BackupOptions,
    backup_dir: &Path,
    trace_id: &str,
) -> Result<BackupResult, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;

    fs::create_dir_all(backup_dir).map_err(|err| {
        AppError::system(format!("Failed to create backup dir: {err}"), trace_id)
    })?;
    let file_name = format!(
        "backup-{}-{}.ab",
        sanitize_filename_component(serial),
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let output_path = backup_dir.join(file_name);
    let output_path_str = output_path.to_string_lossy().to_string();

    let output = run_tool_with_timeout(
        program,
        &backup_args(serial, &output_path_str, options),
        LONG_TIMEOUT,
        trace_id,
    )?;
    ensure_success(output, "Backup", trace_id)?;
    Ok(BackupResult {
        serial: serial.to_string(),
        output_path: output_path_str,
    })
}

pub fn restore_backup(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    backup_path: &str,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    ensure_registered(registry, serial, trace_id)?;
    if !Path::new(backup_path).is_file() {
        return Err(AppError::validation(
            format!("Backup file not found: {backup_path}"),
            trace_id,
        ));
    }

    let restore_args = vec![
        "-s".to_string(),
        serial.to_string(),
        "restore".to_string(),
        backup_path.to_string(),
    ];
    let output = run_tool_with_timeout(program, &restore_args, LONG_TIMEOUT, trace_id)?;
    let output = ensure_success(output, "Restore", trace_id)?;
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success: true,
        message: "Backup restored".to_string(),
        output: output.stdout.trim().to_string(),
    })
}

fn validate_package_name(package: &str, trace_id: &str) -> Result<(), AppError> {
    let trimmed = package.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(AppError::validation(
            "Package name must be a single non-empty token",
            trace_id,
        ));
    }
    Ok(())
}
