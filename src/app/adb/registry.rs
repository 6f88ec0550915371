use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::warn;

use crate::app::adb::parse::{
    parse_battery_info, parse_build_properties, parse_device_list,
};
use crate::app::error::AppError;
use crate::app::events::{
    EventBus, DEVICES_UPDATE_EVENT, DEVICE_CONNECTED_EVENT, DEVICE_DISCONNECTED_EVENT,
};
use crate::app::log_store::LogStore;
use crate::app::models::{DeviceExtendedInfo, DeviceRecord, UNKNOWN};
use crate::app::tools::runner::{args, ensure_success, run_tool};

/// Point-in-time set of ready devices. Always a cache: rebuilt wholesale
/// from the bridge tool's output on every poll, never a source of truth.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Swaps in the new record set. No stale serial survives a
    /// successful poll.
    pub fn replace(&self, records: Vec<DeviceRecord>) {
        let mut devices = self.devices.lock().expect("registry poisoned");
        devices.clear();
        for record in records {
            devices.insert(record.serial.clone(), record);
        }
    }

    pub fn get(&self, serial: &str) -> Option<DeviceRecord> {
        self.devices
            .lock()
            .expect("registry poisoned")
            .get(serial)
            .cloned()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .expect("registry poisoned")
            .contains_key(serial)
    }

    pub fn serials(&self) -> HashSet<String> {
        self.devices
            .lock()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .devices
            .lock()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.serial.cmp(&b.serial));
        records
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the bridge tool's list command and atomically replaces the
/// registry with the ready devices found. Non-ready devices are logged
/// for visibility but excluded.
pub fn detect_devices(
    program: Option<&str>,
    registry: &DeviceRegistry,
    store: &LogStore,
    trace_id: &str,
) -> Result<Vec<DeviceRecord>, AppError> {
    let program = program.ok_or_else(|| {
        AppError::tool_unavailable("Device bridge tool is not installed", trace_id)
    })?;

    let output = run_tool(program, &args(&["devices", "-l"]), trace_id)
        .map_err(|err| AppError::discovery(err.error, trace_id).with_detail(err.detail.unwrap_or_default()))?;
    if !output.success() {
        return Err(AppError::discovery("Device listing failed", trace_id).with_detail(
            format!("exit code {:?}: {}", output.exit_code, output.stderr.trim()),
        ));
    }

    let mut ready = Vec::new();
    for mut record in parse_device_list(&output.stdout) {
        if record.state.is_ready() {
            record.android_version = query_android_version(program, &record.serial, trace_id);
            ready.push(record);
        } else {
            store.debug(
                format!(
                    "Skipping device {} in state {}",
                    record.serial,
                    record.state.as_str()
                ),
                None,
                Some(record.serial.clone()),
            );
        }
    }

    registry.replace(ready.clone());
    store.info(
        format!("Detected {} device(s)", ready.len()),
        Some(json!({ "serials": ready.iter().map(|r| r.serial.clone()).collect::<Vec<_>>() })),
        None,
    );
    Ok(ready)
}

fn query_android_version(program: &str, serial: &str, trace_id: &str) -> String {
    let version_args = args(&["-s", serial, "shell", "getprop", "ro.build.version.release"]);
    match run_tool(program, &version_args, trace_id) {
        Ok(output) if output.success() => {
            let version = output.stdout.trim().to_string();
            if version.is_empty() {
                UNKNOWN.to_string()
            } else {
                version
            }
        }
        Ok(_) | Err(_) => UNKNOWN.to_string(),
    }
}

/// Registry record plus battery and build properties, resolved on
/// demand. Extended lookups are best-effort; a failed property read
/// leaves that section empty rather than failing the call.
pub fn get_device_info(
    program: Option<&str>,
    registry: &DeviceRegistry,
    serial: &str,
    trace_id: &str,
) -> Result<DeviceExtendedInfo, AppError> {
    let record = registry.get(serial).ok_or_else(|| {
        AppError::device_not_found(format!("Device {serial} is not connected"), trace_id)
    })?;
    let program = program.ok_or_else(|| {
        AppError::tool_unavailable("Device bridge tool is not installed", trace_id)
    })?;

    let battery = run_tool(program, &args(&["-s", serial, "shell", "dumpsys", "battery"]), trace_id)
        .and_then(|output| ensure_success(output, "battery query", trace_id))
        .map(|output| parse_battery_info(&output.stdout))
        .unwrap_or_else(|err| {
            warn!(trace_id = %trace_id, serial = %serial, error = %err.error, "battery query failed");
            Default::default()
        });

    let build_properties = run_tool(program, &args(&["-s", serial, "shell", "getprop"]), trace_id)
        .and_then(|output| ensure_success(output, "property query", trace_id))
        .map(|output| parse_build_properties(&output.stdout))
        .unwrap_or_else(|err| {
            warn!(trace_id = %trace_id, serial = %serial, error = %err.error, "property query failed");
            HashMap::new()
        });

    Ok(DeviceExtendedInfo {
        record,
        battery,
        build_properties,
    })
}

/// Symmetric difference between two polls: serials that appeared and
/// serials that went away, each sorted for stable event ordering.
pub fn diff_serials(
    previous: &HashSet<String>,
    current: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let mut connected: Vec<String> = current.difference(previous).cloned().collect();
    let mut disconnected: Vec<String> = previous.difference(current).cloned().collect();
    connected.sort();
    disconnected.sort();
    (connected, disconnected)
}

/// One monitoring tick: poll, diff against the previous serial set,
/// publish membership events. A failed poll is logged at ERROR and
/// leaves the previous set untouched so the loop just tries again.
pub fn run_discovery_poll(
    program: Option<&str>,
    registry: &DeviceRegistry,
    store: &LogStore,
    bus: &EventBus,
    previous: &mut HashSet<String>,
    trace_id: &str,
) {
    let records = match detect_devices(program, registry, store, trace_id) {
        Ok(records) => records,
        Err(err) => {
            store.error(
                format!("Device poll failed: {}", err.error),
                err.detail.clone().map(|detail| json!({ "detail": detail })),
                None,
            );
            return;
        }
    };

    let current: HashSet<String> = records.iter().map(|record| record.serial.clone()).collect();
    let (connected, disconnected) = diff_serials(previous, &current);

    for serial in &connected {
        store.info(
            format!("Device connected: {serial}"),
            None,
            Some(serial.clone()),
        );
        bus.emit(DEVICE_CONNECTED_EVENT, json!({ "serial": serial }));
    }
    for serial in &disconnected {
        store.info(
            format!("Device disconnected: {serial}"),
            None,
            Some(serial.clone()),
        );
        bus.emit(DEVICE_DISCONNECTED_EVENT, json!({ "serial": serial }));
    }
    if !connected.is_empty() || !disconnected.is_empty() {
        bus.emit(DEVICES_UPDATE_EVENT, json!({ "devices": records }));
    }

    *previous = current;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::DeviceState;

    fn record(serial: &str) -> DeviceRecord {
        DeviceRecord::new(serial, DeviceState::Online)
    }

    #[test]
    fn replace_discards_stale_serials() {
        let registry = DeviceRegistry::new();
        registry.replace(vec![record("A"), record("B")]);
        assert!(registry.contains("A"));

        registry.replace(vec![record("B"), record("C")]);
        assert!(!registry.contains("A"));
        assert!(registry.contains("B"));
        assert!(registry.contains("C"));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn snapshot_is_sorted_by_serial() {
        let registry = DeviceRegistry::new();
        registry.replace(vec![record("zulu"), record("alpha")]);
        let serials: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|r| r.serial)
            .collect();
        assert_eq!(serials, vec!["alpha", "zulu"]);
    }

    #[test]
    fn diff_reports_exactly_the_membership_changes() {
        let previous: HashSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let current: HashSet<String> = ["B", "C"].iter().map(|s| s.to_string()).collect();
        let (connected, disconnected) = diff_serials(&previous, &current);
        assert_eq!(connected, vec!["C"]);
        assert_eq!(disconnected, vec!["A"]);
    }

    #[test]
    fn diff_is_empty_for_identical_sets() {
        let set: HashSet<String> = ["A"].iter().map(|s| s.to_string()).collect();
        let (connected, disconnected) = diff_serials(&set, &set.clone());
        assert!(connected.is_empty());
        assert!(disconnected.is_empty());
    }

    #[test]
    fn detect_without_tool_is_tool_unavailable() {
        let registry = DeviceRegistry::new();
        let store = LogStore::new(Default::default());
        let err = detect_devices(None, &registry, &store, "trace-test").expect_err("must fail");
        assert_eq!(err.code, "ERR_TOOL_UNAVAILABLE");
    }

    #[test]
    fn detect_with_missing_binary_is_discovery_error() {
        let registry = DeviceRegistry::new();
        let store = LogStore::new(Default::default());
        let err = detect_devices(
            Some("/no/such/bridge-binary"),
            &registry,
            &store,
            "trace-test",
        )
        .expect_err("must fail");
        assert_eq!(err.code, "ERR_DISCOVERY");
    }

    #[test]
    fn failed_poll_keeps_previous_set_and_logs_error() {
        let registry = DeviceRegistry::new();
        let store = LogStore::new(Default::default());
        let bus = EventBus::new();
        let mut previous: HashSet<String> = ["A".to_string()].into_iter().collect();

        run_discovery_poll(None, &registry, &store, &bus, &mut previous, "trace-test");

        assert!(previous.contains("A"));
        let errors = store.get_logs(&crate::app::log_store::LogFilter {
            level: Some(crate::app::log_store::LogLevel::Error),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Device poll failed"));
    }

    #[test]
    fn missing_device_is_device_not_found() {
        let registry = DeviceRegistry::new();
        let err = get_device_info(Some("adb"), &registry, "ghost", "trace-test")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_DEVICE_NOT_FOUND");
    }
}
