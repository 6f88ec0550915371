use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::models::OperationKind;

/// Keyed exclusivity for destructive operations: one reservation per
/// device serial. A second reservation for the same serial is refused;
/// distinct serials proceed independently.
pub struct DeviceReservations {
    busy: Mutex<HashMap<String, OperationKind>>,
}

impl DeviceReservations {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a guard that releases the serial on drop, or `None` when
    /// the serial already has a live reservation.
    pub fn try_reserve(
        self: &Arc<Self>,
        serial: &str,
        kind: OperationKind,
    ) -> Option<ReservationGuard> {
        let mut busy = self.busy.lock().expect("reservation map poisoned");
        if busy.contains_key(serial) {
            return None;
        }
        busy.insert(serial.to_string(), kind);
        Some(ReservationGuard {
            reservations: Arc::clone(self),
            serial: serial.to_string(),
        })
    }

    pub fn is_busy(&self, serial: &str) -> bool {
        self.busy
            .lock()
            .map(|busy| busy.contains_key(serial))
            .unwrap_or(false)
    }

    pub fn active(&self) -> Vec<(String, OperationKind)> {
        self.busy
            .lock()
            .map(|busy| {
                let mut entries: Vec<_> = busy
                    .iter()
                    .map(|(serial, kind)| (serial.clone(), *kind))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            })
            .unwrap_or_default()
    }

    /// Bookkeeping-only release used by cancellation. The guard's later
    /// drop becomes a no-op.
    pub fn release(&self, serial: &str) -> bool {
        self.busy
            .lock()
            .map(|mut busy| busy.remove(serial).is_some())
            .unwrap_or(false)
    }
}

impl Default for DeviceReservations {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReservationGuard {
    reservations: Arc<DeviceReservations>,
    serial: String,
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.reservations.release(&self.serial);
    }
}

/// Recurring background task with cooperative cancellation. The tick
/// closure runs immediately, then once per interval; `stop()` wakes the
/// loop within one poll slice and joins the thread.
pub struct RecurringTask {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

impl RecurringTask {
    pub fn spawn(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop_flag);
        let join = thread::spawn(move || loop {
            if stop_thread.load(Ordering::Relaxed) {
                return;
            }
            tick();
            let started = Instant::now();
            while started.elapsed() < interval {
                if stop_thread.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(STOP_POLL_SLICE.min(interval));
            }
        });
        Self { stop_flag, join }
    }

    pub fn stop(self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn same_serial_is_refused_until_released() {
        let reservations = Arc::new(DeviceReservations::new());
        let guard = reservations
            .try_reserve("device-1", OperationKind::FactoryReset)
            .expect("first reservation");
        assert!(reservations
            .try_reserve("device-1", OperationKind::FactoryReset)
            .is_none());
        assert!(reservations.is_busy("device-1"));
        drop(guard);
        assert!(!reservations.is_busy("device-1"));
        assert!(reservations
            .try_reserve("device-1", OperationKind::FactoryReset)
            .is_some());
    }

    #[test]
    fn distinct_serials_reserve_independently() {
        let reservations = Arc::new(DeviceReservations::new());
        let _a = reservations
            .try_reserve("device-a", OperationKind::FactoryReset)
            .expect("a");
        let _b = reservations
            .try_reserve("device-b", OperationKind::FactoryReset)
            .expect("b");
        assert_eq!(reservations.active().len(), 2);
    }

    #[test]
    fn manual_release_makes_guard_drop_a_noop() {
        let reservations = Arc::new(DeviceReservations::new());
        let guard = reservations
            .try_reserve("device-1", OperationKind::FactoryReset)
            .expect("reservation");
        assert!(reservations.release("device-1"));
        assert!(!reservations.release("device-1"));
        drop(guard);
        assert!(!reservations.is_busy("device-1"));
    }

    #[test]
    fn recurring_task_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_thread = Arc::clone(&ticks);
        let task = RecurringTask::spawn(Duration::from_millis(20), move || {
            ticks_thread.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(120));
        task.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, got {seen}");
    }
}
