use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::app::models::ToolInfo;
use crate::app::tools::runner::{run_tool_with_timeout, PROBE_TIMEOUT};

/// The two external binaries this system drives. Neither is required
/// for startup; a missing tool degrades the operations that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Device bridge: enumerates and controls devices in their normal
    /// operating mode.
    Bridge,
    /// Bootloader flasher: controls a device switched into its low
    /// level flashing mode.
    Bootloader,
}

impl ToolKind {
    pub fn binary_name(self) -> &'static str {
        match self {
            ToolKind::Bridge => "adb",
            ToolKind::Bootloader => "fastboot",
        }
    }

    /// No-op invocation used by availability probes.
    pub fn version_args(self) -> &'static [&'static str] {
        match self {
            ToolKind::Bridge => &["version"],
            ToolKind::Bootloader => &["--version"],
        }
    }
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

pub fn validate_tool_override(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("Tool path is empty".to_string());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("Tool path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("Tool executable not found at the configured path".to_string());
    }
    Ok(())
}

/// Resolves an invokable program for the tool: configured override
/// first, then the process search path, then platform-conventional SDK
/// install locations. `None` is a degraded state, not an error; the
/// caller memoizes the answer for the process lifetime.
pub fn locate_tool(kind: ToolKind, override_path: &str) -> Option<String> {
    let normalized = normalize_command_path(override_path);
    if !normalized.is_empty() {
        match validate_tool_override(&normalized) {
            Ok(()) => return Some(normalized),
            Err(reason) => {
                warn!(tool = kind.binary_name(), reason = %reason, "ignoring configured tool path");
            }
        }
    }

    let binary = platform_binary_name(kind.binary_name());
    if let Some(found) = search_process_path(&binary) {
        return Some(found.to_string_lossy().to_string());
    }

    for dir in conventional_dirs() {
        let candidate = dir.join(&binary);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }

    warn!(tool = kind.binary_name(), "external tool not found");
    None
}

/// Invokes the tool's version no-op. Any spawn failure or non-zero exit
/// means unavailable; the caller decides whether that is a problem.
pub fn probe_tool(kind: ToolKind, program: Option<&str>, trace_id: &str) -> ToolInfo {
    let Some(program) = program else {
        return ToolInfo {
            available: false,
            version_output: String::new(),
            command_path: kind.binary_name().to_string(),
            error: Some("Tool not found on this system".to_string()),
        };
    };

    let args: Vec<String> = kind.version_args().iter().map(|arg| arg.to_string()).collect();
    match run_tool_with_timeout(program, &args, PROBE_TIMEOUT, trace_id) {
        Ok(output) if output.success() => {
            let version_output = output.stdout.trim().to_string();
            info!(
                trace_id = %trace_id,
                tool = kind.binary_name(),
                version = %version_output.lines().next().unwrap_or_default(),
                "external tool available"
            );
            ToolInfo {
                available: true,
                version_output,
                command_path: program.to_string(),
                error: None,
            }
        }
        Ok(output) => {
            warn!(
                trace_id = %trace_id,
                tool = kind.binary_name(),
                exit_code = ?output.exit_code,
                "external tool version probe failed"
            );
            ToolInfo {
                available: false,
                version_output: output.stdout.trim().to_string(),
                command_path: program.to_string(),
                error: Some(format!(
                    "Version probe exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )),
            }
        }
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                tool = kind.binary_name(),
                error = %err.error,
                "external tool probe error"
            );
            ToolInfo {
                available: false,
                version_output: String::new(),
                command_path: program.to_string(),
                error: Some(err.error),
            }
        }
    }
}

fn platform_binary_name(base: &str) -> String {
    if std::env::consts::OS == "windows" {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

fn search_process_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// SDK platform-tools tend to live in a handful of well-known places
/// when they are not on PATH.
fn conventional_dirs() -> Vec<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_default();
    let system = std::env::consts::OS;
    if system == "windows" {
        let user_profile = std::env::var("USERPROFILE").unwrap_or_default();
        return vec![
            PathBuf::from("C:\\Android\\platform-tools"),
            PathBuf::from("C:\\Program Files\\Android\\platform-tools"),
            PathBuf::from(user_profile).join("AppData\\Local\\Android\\Sdk\\platform-tools"),
        ];
    }
    if system == "macos" {
        return vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from(&home).join("Library/Android/sdk/platform-tools"),
            PathBuf::from(&home).join("Android/Sdk/platform-tools"),
        ];
    }
    vec![
        PathBuf::from("/usr/bin"),
        PathBuf::from("/usr/local/bin"),
        PathBuf::from(&home).join("Android/Sdk/platform-tools"),
    ]
}
