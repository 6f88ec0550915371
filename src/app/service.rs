use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::app::adb::registry::{
    detect_devices, get_device_info, run_discovery_poll, DeviceRegistry,
};
use crate::app::adb::session;
use crate::app::config::{backup_dir, AppConfig};
use crate::app::diagnostics;
use crate::app::error::AppError;
use crate::app::events::{EventBus, EventCallback, OPERATION_COMPLETE_EVENT};
use crate::app::fastboot::orchestrator::{
    self, Orchestrator,
};
use crate::app::log_store::{
    LogEntry, LogFileInfo, LogFilter, LogStats, LogStore, LogStoreSettings,
};
use crate::app::models::{
    BackupOptions, BackupResult, BootloaderDevice, BootloaderVars, CommandResponse,
    DeviceExtendedInfo, DeviceRecord, InstallOutcome, OperationKind, OperationRecord,
    OperationSummary, PackageScope, RebootMode, ScreenshotCapture, ShellCommandResult,
    SimpleOutcome, ToolInfo,
};
use crate::app::scheduler::RecurringTask;
use crate::app::tools::locator::{locate_tool, probe_tool, ToolKind};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Facade the transport layer talks to. Owns the log store, event bus,
/// device registry and orchestrator; resolves tool paths once per
/// process; every call gets a fresh trace id and a `CommandResponse`
/// envelope. Authorization is the caller's job.
pub struct DeviceService {
    config: AppConfig,
    store: Arc<LogStore>,
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    orchestrator: Orchestrator,
    bridge: OnceLock<Option<String>>,
    bootloader: OnceLock<Option<String>>,
    monitor: Mutex<Option<RecurringTask>>,
    flusher: Mutex<Option<RecurringTask>>,
}

impl DeviceService {
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(LogStore::new(LogStoreSettings::from_config(&config)));
        Self {
            config,
            store,
            bus: Arc::new(EventBus::new()),
            registry: Arc::new(DeviceRegistry::new()),
            orchestrator: Orchestrator::new(),
            bridge: OnceLock::new(),
            bootloader: OnceLock::new(),
            monitor: Mutex::new(None),
            flusher: Mutex::new(None),
        }
    }

    /// Probes both tools, starts the log flusher, and optionally the
    /// discovery monitor. A missing tool only degrades dependent calls.
    pub fn start(&self) {
        let trace_id = new_trace_id();
        for kind in [ToolKind::Bridge, ToolKind::Bootloader] {
            let program = self.program_for(kind);
            let info = probe_tool(kind, program.as_deref(), &trace_id);
            if info.available {
                self.store.info(
                    format!("{} available: {}", kind.binary_name(), first_line(&info.version_output)),
                    Some(json!({ "path": info.command_path })),
                    None,
                );
            } else {
                self.store.warn(
                    format!("{} unavailable", kind.binary_name()),
                    info.error.clone().map(|error| json!({ "error": error })),
                    None,
                );
            }
        }

        let mut flusher = self.flusher.lock().expect("flusher slot poisoned");
        if flusher.is_none() {
            let store = Arc::clone(&self.store);
            *flusher = Some(RecurringTask::spawn(FLUSH_INTERVAL, move || store.flush()));
        }
        drop(flusher);

        if self.config.device.auto_start_monitoring {
            self.start_monitoring(None);
        }
    }

    /// Stops background tasks and flushes buffered log entries.
    pub fn shutdown(&self) {
        self.stop_monitoring();
        if let Some(task) = self.flusher.lock().expect("flusher slot poisoned").take() {
            task.stop();
        }
        self.store.flush();
    }

    fn program_for(&self, kind: ToolKind) -> Option<String> {
        let slot = match kind {
            ToolKind::Bridge => &self.bridge,
            ToolKind::Bootloader => &self.bootloader,
        };
        let override_path = match kind {
            ToolKind::Bridge => &self.config.tools.bridge_path,
            ToolKind::Bootloader => &self.config.tools.bootloader_path,
        };
        slot.get_or_init(|| locate_tool(kind, override_path)).clone()
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ---- tool availability ----

    pub fn check_bridge_tool(&self) -> CommandResponse<ToolInfo> {
        let trace_id = new_trace_id();
        let info = probe_tool(ToolKind::Bridge, self.program_for(ToolKind::Bridge).as_deref(), &trace_id);
        CommandResponse { trace_id, data: info }
    }

    pub fn check_bootloader_tool(&self) -> CommandResponse<ToolInfo> {
        let trace_id = new_trace_id();
        let info = probe_tool(
            ToolKind::Bootloader,
            self.program_for(ToolKind::Bootloader).as_deref(),
            &trace_id,
        );
        CommandResponse { trace_id, data: info }
    }

    // ---- discovery ----

    pub fn detect_devices(&self) -> Result<CommandResponse<Vec<DeviceRecord>>, AppError> {
        let trace_id = new_trace_id();
        let devices = detect_devices(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            &self.store,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: devices })
    }

    pub fn list_devices(&self) -> CommandResponse<Vec<DeviceRecord>> {
        CommandResponse {
            trace_id: new_trace_id(),
            data: self.registry.snapshot(),
        }
    }

    pub fn get_device_info(
        &self,
        serial: &str,
    ) -> Result<CommandResponse<DeviceExtendedInfo>, AppError> {
        let trace_id = new_trace_id();
        let info = get_device_info(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: info })
    }

    /// Begins the recurring discovery poll. Returns false when a
    /// monitor is already running. Poll failures are logged and do not
    /// stop the loop; `stop_monitoring` cancels it.
    pub fn start_monitoring(&self, interval: Option<Duration>) -> bool {
        let mut monitor = self.monitor.lock().expect("monitor slot poisoned");
        if monitor.is_some() {
            return false;
        }
        let interval =
            interval.unwrap_or(Duration::from_secs(self.config.device.poll_interval_secs));
        let program = self.program_for(ToolKind::Bridge);
        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let mut previous: HashSet<String> = registry.serials();
        *monitor = Some(RecurringTask::spawn(interval, move || {
            let trace_id = new_trace_id();
            run_discovery_poll(
                program.as_deref(),
                &registry,
                &store,
                &bus,
                &mut previous,
                &trace_id,
            );
        }));
        true
    }

    pub fn stop_monitoring(&self) -> bool {
        match self.monitor.lock().expect("monitor slot poisoned").take() {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().expect("monitor slot poisoned").is_some()
    }

    // ---- session operations ----

    pub fn reboot(
        &self,
        serial: &str,
        mode: RebootMode,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::reboot(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            mode,
            &trace_id,
        );
        self.publish_session_outcome(serial, OperationKind::Reboot, &outcome);
        outcome.map(|data| CommandResponse { trace_id, data })
    }

    pub fn execute_shell_command(
        &self,
        serial: &str,
        command: &str,
    ) -> Result<CommandResponse<ShellCommandResult>, AppError> {
        let trace_id = new_trace_id();
        let result = session::run_shell(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            command,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: result })
    }

    pub fn capture_screenshot(
        &self,
        serial: &str,
    ) -> Result<CommandResponse<ScreenshotCapture>, AppError> {
        let trace_id = new_trace_id();
        let capture = session::capture_screenshot(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: capture })
    }

    pub fn install_package(
        &self,
        serial: &str,
        apk_path: &str,
    ) -> Result<CommandResponse<InstallOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::install_package(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            apk_path,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    pub fn uninstall_package(
        &self,
        serial: &str,
        package: &str,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::uninstall_package(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            package,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    pub fn list_packages(
        &self,
        serial: &str,
        scope: PackageScope,
    ) -> Result<CommandResponse<Vec<String>>, AppError> {
        let trace_id = new_trace_id();
        let packages = session::list_packages(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            scope,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: packages })
    }

    pub fn clear_package_data(
        &self,
        serial: &str,
        package: &str,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::clear_package_data(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            package,
            &trace_id,
        );
        self.publish_session_outcome(serial, OperationKind::ClearCache, &outcome);
        outcome.map(|data| CommandResponse { trace_id, data })
    }

    pub fn set_developer_mode(
        &self,
        serial: &str,
        enabled: bool,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::set_developer_mode(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            enabled,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    pub fn create_backup(
        &self,
        serial: &str,
        options: BackupOptions,
    ) -> Result<CommandResponse<BackupResult>, AppError> {
        let trace_id = new_trace_id();
        let result = session::create_backup(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            options,
            &backup_dir(&self.config),
            &trace_id,
        )?;
        self.store.info(
            format!("Backup written to {}", result.output_path),
            None,
            Some(serial.to_string()),
        );
        Ok(CommandResponse { trace_id, data: result })
    }

    pub fn restore_backup(
        &self,
        serial: &str,
        backup_path: &str,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = session::restore_backup(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.registry,
            serial,
            backup_path,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    // ---- destructive operations ----

    pub fn run_factory_reset(
        &self,
        serial: &str,
    ) -> Result<CommandResponse<OperationSummary>, AppError> {
        let trace_id = new_trace_id();
        let summary = self.orchestrator.run_factory_reset(
            self.program_for(ToolKind::Bootloader).as_deref(),
            serial,
            &self.bus,
            &self.store,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: summary })
    }

    pub fn operation_status(&self) -> CommandResponse<Vec<OperationRecord>> {
        CommandResponse {
            trace_id: new_trace_id(),
            data: self.orchestrator.operation_status(),
        }
    }

    /// Bookkeeping-only cancel; the running subprocess is not killed.
    pub fn cancel_operation(&self, serial: &str) -> CommandResponse<bool> {
        let cancelled = self.orchestrator.cancel_operation(serial);
        if cancelled {
            self.store.warn(
                format!("Operation bookkeeping cleared for {serial}"),
                None,
                Some(serial.to_string()),
            );
        }
        CommandResponse {
            trace_id: new_trace_id(),
            data: cancelled,
        }
    }

    pub fn list_bootloader_devices(
        &self,
    ) -> Result<CommandResponse<Vec<BootloaderDevice>>, AppError> {
        let trace_id = new_trace_id();
        let devices = orchestrator::list_bootloader_devices(
            self.program_for(ToolKind::Bootloader).as_deref(),
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: devices })
    }

    pub fn bootloader_device_info(
        &self,
        serial: &str,
    ) -> Result<CommandResponse<BootloaderVars>, AppError> {
        let trace_id = new_trace_id();
        let vars = orchestrator::bootloader_device_info(
            self.program_for(ToolKind::Bootloader).as_deref(),
            serial,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: vars })
    }

    pub fn unlock_bootloader(
        &self,
        serial: &str,
        confirmed: bool,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = orchestrator::unlock_bootloader(
            self.program_for(ToolKind::Bootloader).as_deref(),
            serial,
            confirmed,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    pub fn lock_bootloader(
        &self,
        serial: &str,
    ) -> Result<CommandResponse<SimpleOutcome>, AppError> {
        let trace_id = new_trace_id();
        let outcome = orchestrator::lock_bootloader(
            self.program_for(ToolKind::Bootloader).as_deref(),
            serial,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: outcome })
    }

    // ---- log store access ----

    pub fn get_logs(&self, filter: &LogFilter) -> CommandResponse<Vec<LogEntry>> {
        CommandResponse {
            trace_id: new_trace_id(),
            data: self.store.get_logs(filter),
        }
    }

    pub fn log_stats(&self) -> CommandResponse<LogStats> {
        CommandResponse {
            trace_id: new_trace_id(),
            data: self.store.stats(),
        }
    }

    pub fn list_log_files(&self) -> CommandResponse<Vec<LogFileInfo>> {
        CommandResponse {
            trace_id: new_trace_id(),
            data: self.store.list_files(),
        }
    }

    pub fn read_log_file(&self, name: &str) -> Result<CommandResponse<Vec<LogEntry>>, AppError> {
        let trace_id = new_trace_id();
        let entries = self.store.read_file(name, &trace_id)?;
        Ok(CommandResponse { trace_id, data: entries })
    }

    pub fn clear_logs(&self) -> CommandResponse<()> {
        self.store.clear();
        self.store.info("In-memory logs cleared", None, None);
        CommandResponse {
            trace_id: new_trace_id(),
            data: (),
        }
    }

    pub fn export_logs_json(
        &self,
        path: PathBuf,
        filter: &LogFilter,
    ) -> Result<CommandResponse<usize>, AppError> {
        let trace_id = new_trace_id();
        let written = self.store.export_json(&path, filter, &trace_id)?;
        Ok(CommandResponse { trace_id, data: written })
    }

    pub fn export_logs_delimited(
        &self,
        path: PathBuf,
        filter: &LogFilter,
    ) -> Result<CommandResponse<usize>, AppError> {
        let trace_id = new_trace_id();
        let written = self.store.export_delimited(&path, filter, &trace_id)?;
        Ok(CommandResponse { trace_id, data: written })
    }

    pub fn subscribe_log_stream(
        &self,
        filter: LogFilter,
        callback: Arc<dyn Fn(&LogEntry) + Send + Sync>,
    ) -> u64 {
        self.store.subscribe(filter, callback)
    }

    pub fn unsubscribe_log_stream(&self, id: u64) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn subscribe_events(&self, callback: EventCallback) -> u64 {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe_events(&self, id: u64) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn export_diagnostics_bundle(
        &self,
        output_dir: Option<String>,
    ) -> Result<CommandResponse<PathBuf>, AppError> {
        let trace_id = new_trace_id();
        let bundle = diagnostics::export_diagnostics_bundle(
            self.program_for(ToolKind::Bridge).as_deref(),
            &self.store,
            output_dir,
            &trace_id,
        )?;
        Ok(CommandResponse { trace_id, data: bundle })
    }

    fn publish_session_outcome(
        &self,
        serial: &str,
        kind: OperationKind,
        outcome: &Result<SimpleOutcome, AppError>,
    ) {
        let payload = match outcome {
            Ok(result) => json!({
                "serial": serial,
                "kind": kind.as_str(),
                "success": result.success,
                "message": result.message,
            }),
            Err(err) => json!({
                "serial": serial,
                "kind": kind.as_str(),
                "success": false,
                "error": err.error,
            }),
        };
        self.store.info(
            format!("Operation {} finished", kind.as_str()),
            Some(payload.clone()),
            Some(serial.to_string()),
        );
        self.bus.emit(OPERATION_COMPLETE_EVENT, payload);
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
