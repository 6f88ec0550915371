use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;
use zip::write::FileOptions;

use crate::app::adb::parse::parse_device_list;
use crate::app::adb::session::sanitize_filename_component;
use crate::app::error::AppError;
use crate::app::log_store::{LogEntry, LogStore};
use crate::app::models::DeviceRecord;
use crate::app::tools::runner::{args, run_tool};

const RECENT_LOG_COUNT: usize = 200;

#[derive(Debug, Serialize)]
struct DiagnosticsManifest {
    app_version: &'static str,
    os: &'static str,
    arch: &'static str,
    timestamp_utc: String,
    trace_id: String,
}

#[derive(Debug, Serialize)]
struct DevicesPayload {
    parsed: Vec<DeviceRecord>,
    raw_stdout: String,
    raw_stderr: String,
    exit_code: Option<i32>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiagnosticsPayload {
    manifest: DiagnosticsManifest,
    devices: DevicesPayload,
    recent_logs: Vec<LogEntry>,
}

/// Writes a support bundle: manifest, a fresh device listing (raw and
/// parsed), and the most recent log entries. A missing bridge tool is
/// recorded in the bundle rather than failing the export.
pub fn export_diagnostics_bundle(
    bridge_program: Option<&str>,
    store: &LogStore,
    output_dir: Option<String>,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let resolved_dir = match output_dir.map(|dir| dir.trim().to_string()).filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("droiddock_diagnostics"),
    };
    fs::create_dir_all(&resolved_dir).map_err(|err| {
        AppError::system(format!("Failed to create output dir: {err}"), trace_id)
    })?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let safe_trace = sanitize_filename_component(trace_id);
    let trace_short = safe_trace.chars().take(8).collect::<String>();
    let bundle_path = resolved_dir.join(format!("diagnostics_{timestamp}_{trace_short}.zip"));

    let manifest = DiagnosticsManifest {
        app_version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        timestamp_utc: Utc::now().to_rfc3339(),
        trace_id: trace_id.to_string(),
    };

    let mut devices = DevicesPayload {
        parsed: Vec::new(),
        raw_stdout: String::new(),
        raw_stderr: String::new(),
        exit_code: None,
        error: None,
    };
    match bridge_program {
        Some(program) => match run_tool(program, &args(&["devices", "-l"]), trace_id) {
            Ok(output) => {
                devices.exit_code = output.exit_code;
                devices.raw_stdout = output.stdout.clone();
                devices.raw_stderr = output.stderr.clone();
                devices.parsed = parse_device_list(&output.stdout);
            }
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    error = %err.error,
                    "failed to list devices for diagnostics"
                );
                devices.error = Some(err.error);
            }
        },
        None => devices.error = Some("Device bridge tool is not installed".to_string()),
    }

    let payload = DiagnosticsPayload {
        manifest,
        devices,
        recent_logs: store.recent(RECENT_LOG_COUNT),
    };

    let json = serde_json::to_vec_pretty(&payload).map_err(|err| {
        AppError::system(format!("Failed to serialize diagnostics payload: {err}"), trace_id)
    })?;

    let file = fs::File::create(&bundle_path)
        .map_err(|err| AppError::system(format!("Failed to create bundle: {err}"), trace_id))?;
    let mut bundle = zip::ZipWriter::new(file);
    bundle
        .start_file("diagnostics.json", FileOptions::<()>::default())
        .map_err(|err| AppError::system(format!("Failed to write bundle: {err}"), trace_id))?;
    bundle
        .write_all(&json)
        .map_err(|err| AppError::system(format!("Failed to write bundle: {err}"), trace_id))?;
    bundle
        .finish()
        .map_err(|err| AppError::system(format!("Failed to finalize bundle: {err}"), trace_id))?;

    Ok(bundle_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::log_store::LogStoreSettings;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    #[test]
    fn export_succeeds_without_bridge_tool() {
        let dir = TempDir::new().expect("tmp");
        let mut settings = LogStoreSettings::default();
        settings.log_to_file = false;
        let store = LogStore::new(settings);
        store.info("bundle me", None, Some("serial-1".to_string()));

        let bundle = export_diagnostics_bundle(
            None,
            &store,
            Some(dir.path().to_string_lossy().to_string()),
            "trace-diagnostics",
        )
        .expect("bundle");

        let bytes = fs::read(&bundle).expect("read bundle");
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip");
        let mut file = archive.by_name("diagnostics.json").expect("entry");
        let mut content = String::new();
        file.read_to_string(&mut content).expect("read");

        assert!(content.contains("\"trace_id\""));
        assert!(content.contains("bundle me"));
        assert!(content.contains("not installed"));
    }
}
