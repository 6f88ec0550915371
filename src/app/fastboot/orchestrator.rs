use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::app::error::AppError;
use crate::app::events::{EventBus, OPERATION_COMPLETE_EVENT, OPERATION_PROGRESS_EVENT};
use crate::app::fastboot::parse::{parse_bootloader_devices, parse_getvar_value};
use crate::app::log_store::LogStore;
use crate::app::models::{
    BootloaderDevice, BootloaderVars, OperationKind, OperationRecord, OperationStatus,
    OperationSummary, SimpleOutcome, StepOutcome,
};
use crate::app::scheduler::{DeviceReservations, ReservationGuard};
use crate::app::tools::runner::{args, ensure_success, run_tool, run_tool_with_timeout};

/// Per-step limit for erase/reboot commands.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause between steps so the device settles before the next command.
pub const STEP_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ResetStep {
    pub name: &'static str,
    pub tool_args: &'static [&'static str],
    /// A critical step failing aborts the remainder of the sequence;
    /// partial destructive state is worse than an incomplete cleanup.
    pub critical: bool,
}

/// Factory reset, in execution order.
pub const FACTORY_RESET_STEPS: &[ResetStep] = &[
    ResetStep {
        name: "erase-userdata",
        tool_args: &["erase", "userdata"],
        critical: true,
    },
    ResetStep {
        name: "erase-cache",
        tool_args: &["erase", "cache"],
        critical: false,
    },
    ResetStep {
        name: "erase-system",
        tool_args: &["erase", "system"],
        critical: false,
    },
    ResetStep {
        name: "reboot",
        tool_args: &["reboot"],
        critical: false,
    },
];

/// Coordinates multi-step destructive operations. Exclusivity is keyed
/// per device serial: a second request for a busy device is rejected
/// immediately, requests for distinct devices proceed concurrently.
pub struct Orchestrator {
    reservations: Arc<DeviceReservations>,
    operations: Mutex<HashMap<String, OperationRecord>>,
}

struct OperationTicket<'a> {
    orchestrator: &'a Orchestrator,
    serial: String,
    _guard: ReservationGuard,
}

impl Drop for OperationTicket<'_> {
    // Terminal cleanup happens here so a failing or panicking step can
    // never leave the device locked or its record stranded.
    fn drop(&mut self) {
        if let Ok(mut operations) = self.orchestrator.operations.lock() {
            operations.remove(&self.serial);
        }
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            reservations: Arc::new(DeviceReservations::new()),
            operations: Mutex::new(HashMap::new()),
        }
    }

    fn begin(
        &self,
        serial: &str,
        kind: OperationKind,
        trace_id: &str,
    ) -> Result<OperationTicket<'_>, AppError> {
        let guard = self
            .reservations
            .try_reserve(serial, kind)
            .ok_or_else(|| {
                AppError::operation_in_progress(
                    format!("An operation is already running on {serial}"),
                    trace_id,
                )
            })?;
        let record = OperationRecord {
            serial: serial.to_string(),
            kind,
            status: OperationStatus::Starting,
            progress: Some(0),
            started_at: Utc::now(),
        };
        self.operations
            .lock()
            .expect("operations map poisoned")
            .insert(serial.to_string(), record);
        Ok(OperationTicket {
            orchestrator: self,
            serial: serial.to_string(),
            _guard: guard,
        })
    }

    fn update_record(&self, serial: &str, status: OperationStatus, progress: Option<u8>) {
        if let Ok(mut operations) = self.operations.lock() {
            if let Some(record) = operations.get_mut(serial) {
                record.status = status;
                record.progress = progress;
            }
        }
    }

    /// In-flight operation records, sorted by serial.
    pub fn operation_status(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .lock()
            .expect("operations map poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.serial.cmp(&b.serial));
        records
    }

    /// Clears the reservation and record for a device. Bookkeeping only:
    /// the running subprocess is not signalled and the in-flight step
    /// still runs to completion.
    pub fn cancel_operation(&self, serial: &str) -> bool {
        let released = self.reservations.release(serial);
        let removed = self
            .operations
            .lock()
            .map(|mut operations| operations.remove(serial).is_some())
            .unwrap_or(false);
        released || removed
    }

    /// Runs the full factory-reset sequence against a device that is
    /// already in bootloader mode.
    pub fn run_factory_reset(
        &self,
        program: Option<&str>,
        serial: &str,
        bus: &EventBus,
        store: &LogStore,
        trace_id: &str,
    ) -> Result<OperationSummary, AppError> {
        let program = require_program(program, trace_id)?;

        let listed = list_bootloader_devices(Some(program), trace_id)?;
        if !listed.iter().any(|device| device.serial == serial) {
            return Err(AppError::device_not_found(
                format!("Device {serial} is not in bootloader mode"),
                trace_id,
            ));
        }

        let owned_program = program.to_string();
        let owned_serial = serial.to_string();
        let owned_trace = trace_id.to_string();
        self.run_factory_reset_with(
            serial,
            move |step| {
                let mut step_args = vec!["-s".to_string(), owned_serial.clone()];
                step_args.extend(step.tool_args.iter().map(|arg| arg.to_string()));
                let output = run_tool_with_timeout(
                    &owned_program,
                    &step_args,
                    STEP_TIMEOUT,
                    &owned_trace,
                )?;
                let output = ensure_success(output, step.name, &owned_trace)?;
                Ok(output.combined().trim().to_string())
            },
            bus,
            store,
            STEP_SETTLE,
            trace_id,
        )
    }

    /// Sequencing policy with the step executor injected, so tests can
    /// drive the escalation rules without a real bootloader tool.
    pub fn run_factory_reset_with(
        &self,
        serial: &str,
        mut exec: impl FnMut(&ResetStep) -> Result<String, AppError>,
        bus: &EventBus,
        store: &LogStore,
        settle: Duration,
        trace_id: &str,
    ) -> Result<OperationSummary, AppError> {
        let kind = OperationKind::FactoryReset;
        let _ticket = self.begin(serial, kind, trace_id)?;

        store.info(
            format!("Factory reset started for {serial}"),
            None,
            Some(serial.to_string()),
        );
        publish_progress(bus, store, serial, kind, OperationStatus::Starting, 0);

        let total = FACTORY_RESET_STEPS.len();
        let mut steps: Vec<StepOutcome> = Vec::with_capacity(total);
        for (index, step) in FACTORY_RESET_STEPS.iter().enumerate() {
            let progress = (index * 100 / total) as u8;
            self.update_record(serial, OperationStatus::Running, Some(progress));
            publish_progress(bus, store, serial, kind, OperationStatus::Running, progress);

            match exec(step) {
                Ok(output) => {
                    steps.push(StepOutcome {
                        step: step.name.to_string(),
                        success: true,
                        output: Some(output),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(
                        trace_id = %trace_id,
                        serial = %serial,
                        step = step.name,
                        error = %err.error,
                        "factory reset step failed"
                    );
                    steps.push(StepOutcome {
                        step: step.name.to_string(),
                        success: false,
                        output: None,
                        error: Some(err.error.clone()),
                    });
                    if step.critical {
                        let message =
                            format!("Factory reset aborted: critical step {} failed", step.name);
                        self.update_record(serial, OperationStatus::Failed, None);
                        publish_complete(bus, store, serial, kind, false, &message, &steps);
                        return Err(AppError::critical_step(message, trace_id)
                            .with_detail(err.detail.unwrap_or(err.error)));
                    }
                }
            }

            if index + 1 < total && !settle.is_zero() {
                std::thread::sleep(settle);
            }
        }

        let failed: Vec<&str> = steps
            .iter()
            .filter(|outcome| !outcome.success)
            .map(|outcome| outcome.step.as_str())
            .collect();
        let success = failed.is_empty();
        let message = if success {
            "Factory reset completed".to_string()
        } else {
            format!("Factory reset completed with failed steps: {}", failed.join(", "))
        };
        self.update_record(
            serial,
            if success {
                OperationStatus::Succeeded
            } else {
                OperationStatus::Failed
            },
            Some(100),
        );
        publish_complete(bus, store, serial, kind, success, &message, &steps);

        Ok(OperationSummary {
            serial: serial.to_string(),
            kind,
            success,
            message,
            steps,
        })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn require_program<'a>(program: Option<&'a str>, trace_id: &str) -> Result<&'a str, AppError> {
    program.ok_or_else(|| {
        AppError::tool_unavailable("Bootloader tool is not installed", trace_id)
    })
}

fn publish_progress(
    bus: &EventBus,
    store: &LogStore,
    serial: &str,
    kind: OperationKind,
    status: OperationStatus,
    progress: u8,
) {
    let payload = json!({
        "serial": serial,
        "kind": kind.as_str(),
        "status": status,
        "progress": progress,
    });
    store.info(
        format!("Operation {} progress {progress}%", kind.as_str()),
        Some(payload.clone()),
        Some(serial.to_string()),
    );
    bus.emit(OPERATION_PROGRESS_EVENT, payload);
}

fn publish_complete(
    bus: &EventBus,
    store: &LogStore,
    serial: &str,
    kind: OperationKind,
    success: bool,
    message: &str,
    steps: &[StepOutcome],
) {
    let mut payload = json!({
        "serial": serial,
        "kind": kind.as_str(),
        "success": success,
        "steps": steps,
    });
    if success {
        payload["message"] = json!(message);
    } else {
        payload["error"] = json!(message);
    }
    // A disconnected caller can recover the outcome from the log stream.
    if success {
        store.info(message.to_string(), Some(payload.clone()), Some(serial.to_string()));
    } else {
        store.error(message.to_string(), Some(payload.clone()), Some(serial.to_string()));
    }
    bus.emit(OPERATION_COMPLETE_EVENT, payload);
}

/// Devices currently visible to the bootloader tool.
pub fn list_bootloader_devices(
    program: Option<&str>,
    trace_id: &str,
) -> Result<Vec<BootloaderDevice>, AppError> {
    let program = require_program(program, trace_id)?;
    let output = run_tool(program, &args(&["devices"]), trace_id)?;
    let output = ensure_success(output, "Bootloader device listing", trace_id)?;
    Ok(parse_bootloader_devices(&output.stdout))
}

/// Identity variables of a device in bootloader mode.
pub fn bootloader_device_info(
    program: Option<&str>,
    serial: &str,
    trace_id: &str,
) -> Result<BootloaderVars, AppError> {
    let program = require_program(program, trace_id)?;
    let mut values: Vec<Option<String>> = Vec::with_capacity(3);
    for var in ["product", "manufacturer", "serialno"] {
        let output = run_tool(program, &args(&["-s", serial, "getvar", var]), trace_id)?;
        let output = ensure_success(output, "Bootloader variable query", trace_id)?;
        values.push(parse_getvar_value(&output.combined(), var));
    }
    Ok(BootloaderVars {
        serial: serial.to_string(),
        product: values[0].clone(),
        manufacturer: values[1].clone(),
        reported_serial: values[2].clone(),
    })
}

/// Unlocking wipes the device; an explicit confirmation flag is
/// required so a bare API call cannot trigger it.
pub fn unlock_bootloader(
    program: Option<&str>,
    serial: &str,
    confirmed: bool,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    if !confirmed {
        return Err(AppError::validation(
            "Bootloader unlock requires explicit confirmation",
            trace_id,
        ));
    }
    let program = require_program(program, trace_id)?;
    warn!(trace_id = %trace_id, serial = %serial, "bootloader unlock erases all device data");
    let output =
        run_tool_with_timeout(program, &args(&["-s", serial, "oem", "unlock"]), STEP_TIMEOUT, trace_id)?;
    let output = ensure_success(output, "Bootloader unlock", trace_id)?;
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success: true,
        message: "Bootloader unlocked".to_string(),
        output: output.combined().trim().to_string(),
    })
}

pub fn lock_bootloader(
    program: Option<&str>,
    serial: &str,
    trace_id: &str,
) -> Result<SimpleOutcome, AppError> {
    let program = require_program(program, trace_id)?;
    let output =
        run_tool_with_timeout(program, &args(&["-s", serial, "oem", "lock"]), STEP_TIMEOUT, trace_id)?;
    let output = ensure_success(output, "Bootloader lock", trace_id)?;
    Ok(SimpleOutcome {
        serial: serial.to_string(),
        success: true,
        message: "Bootloader locked".to_string(),
        output: output.combined().trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::BusEvent;
    use crate::app::log_store::LogStoreSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_store() -> LogStore {
        let mut settings = LogStoreSettings::default();
        settings.log_to_file = false;
        LogStore::new(settings)
    }

    fn step_ok(_step: &ResetStep) -> Result<String, AppError> {
        Ok("OKAY".to_string())
    }

    #[test]
    fn all_steps_succeed_yields_success_summary() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();
        let summary = orchestrator
            .run_factory_reset_with(
                "serial-1",
                step_ok,
                &bus,
                &store,
                Duration::ZERO,
                "trace-test",
            )
            .expect("summary");
        assert!(summary.success);
        assert_eq!(summary.steps.len(), FACTORY_RESET_STEPS.len());
        assert!(summary.steps.iter().all(|step| step.success));
        assert!(orchestrator.operation_status().is_empty());
    }

    #[test]
    fn critical_step_failure_aborts_remaining_steps() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();
        let executed = AtomicUsize::new(0);
        let err = orchestrator
            .run_factory_reset_with(
                "serial-1",
                |_step| {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::command("FAILED (remote: partition error)", "trace-test"))
                },
                &bus,
                &store,
                Duration::ZERO,
                "trace-test",
            )
            .expect_err("must abort");
        assert_eq!(err.code, "ERR_CRITICAL_STEP");
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        // Exclusivity and the record are released on the abort path too.
        assert!(orchestrator.operation_status().is_empty());
        let retry = orchestrator.run_factory_reset_with(
            "serial-1",
            step_ok,
            &bus,
            &store,
            Duration::ZERO,
            "trace-test",
        );
        assert!(retry.is_ok());
    }

    #[test]
    fn best_effort_failure_continues_and_reports_partial_summary() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();
        let summary = orchestrator
            .run_factory_reset_with(
                "serial-1",
                |step| {
                    if step.name == "erase-cache" {
                        Err(AppError::command("FAILED (remote: no cache)", "trace-test"))
                    } else {
                        Ok("OKAY".to_string())
                    }
                },
                &bus,
                &store,
                Duration::ZERO,
                "trace-test",
            )
            .expect("summary");
        assert!(!summary.success);
        assert_eq!(summary.steps.len(), 4);
        assert!(summary.steps[0].success);
        assert!(!summary.steps[1].success);
        assert!(summary.steps[2].success);
        assert!(summary.steps[3].success);
        assert!(summary.message.contains("erase-cache"));
    }

    #[test]
    fn second_request_for_same_device_is_rejected() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();
        let successes = AtomicUsize::new(0);
        let rejections = AtomicUsize::new(0);
        let barrier = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    barrier.wait();
                    let result = orchestrator.run_factory_reset_with(
                        "serial-1",
                        |_step| {
                            std::thread::sleep(Duration::from_millis(30));
                            Ok("OKAY".to_string())
                        },
                        &bus,
                        &store,
                        Duration::ZERO,
                        "trace-test",
                    );
                    match result {
                        Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                        Err(err) => {
                            assert_eq!(err.code, "ERR_OPERATION_IN_PROGRESS");
                            rejections.fetch_add(1, Ordering::SeqCst)
                        }
                    };
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(rejections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_devices_run_concurrently() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();

        let orchestrator_ref = &orchestrator;
        let bus_ref = &bus;
        let store_ref = &store;
        std::thread::scope(|scope| {
            for serial in ["serial-a", "serial-b"] {
                scope.spawn(move || {
                    orchestrator_ref
                        .run_factory_reset_with(
                            serial,
                            |_step| {
                                std::thread::sleep(Duration::from_millis(10));
                                Ok("OKAY".to_string())
                            },
                            bus_ref,
                            store_ref,
                            Duration::ZERO,
                            "trace-test",
                        )
                        .expect("summary");
                });
            }
        });
    }

    #[test]
    fn emits_progress_then_exactly_one_terminal_event() {
        let orchestrator = Orchestrator::new();
        let bus = EventBus::new();
        let store = test_store();
        let events: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_cb = Arc::clone(&events);
        bus.subscribe(Arc::new(move |event| {
            events_cb.lock().unwrap().push(event.clone());
        }));

        orchestrator
            .run_factory_reset_with(
                "serial-1",
                step_ok,
                &bus,
                &store,
                Duration::ZERO,
                "trace-test",
            )
            .expect("summary");

        let events = events.lock().unwrap();
        let progress_count = events
            .iter()
            .filter(|event| event.name == OPERATION_PROGRESS_EVENT)
            .count();
        let complete: Vec<&BusEvent> = events
            .iter()
            .filter(|event| event.name == OPERATION_COMPLETE_EVENT)
            .collect();
        assert_eq!(progress_count, 1 + FACTORY_RESET_STEPS.len());
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].payload["success"], true);
        assert_eq!(complete[0].payload["serial"], "serial-1");
    }

    #[test]
    fn cancel_clears_bookkeeping() {
        let orchestrator = Orchestrator::new();
        assert!(!orchestrator.cancel_operation("serial-1"));
        let ticket = orchestrator
            .begin("serial-1", OperationKind::FactoryReset, "trace-test")
            .expect("ticket");
        assert_eq!(orchestrator.operation_status().len(), 1);
        assert!(orchestrator.cancel_operation("serial-1"));
        assert!(orchestrator.operation_status().is_empty());
        drop(ticket);
        assert!(!orchestrator.cancel_operation("serial-1"));
    }

    #[test]
    fn step_table_order_and_criticality() {
        assert_eq!(FACTORY_RESET_STEPS[0].name, "erase-userdata");
        assert!(FACTORY_RESET_STEPS[0].critical);
        assert!(FACTORY_RESET_STEPS[1..].iter().all(|step| !step.critical));
        assert_eq!(FACTORY_RESET_STEPS.last().unwrap().name, "reboot");
    }

    #[test]
    fn unlock_requires_confirmation() {
        let err = unlock_bootloader(Some("fastboot"), "serial-1", false, "trace-test")
            .expect_err("must refuse");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn missing_tool_is_tool_unavailable() {
        let err = list_bootloader_devices(None, "trace-test").expect_err("must fail");
        assert_eq!(err.code, "ERR_TOOL_UNAVAILABLE");
    }
}
