//! Capture of unhandled failures as error spans
//!
//! The host forwards errors it observes through `Tracker::capture_error`.
//! For the process itself, [`install_panic_hook`] turns panics into
//! [`ErrorReport`]s and then defers to the previously installed hook.
//!
//! Reports are handed to a short-lived reporter thread. The panicking
//! thread may be holding one of the tracker's own locks, and it releases
//! them only while unwinding, after the hook returns. A panic raised while
//! a report is being delivered is not reported again.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event::ErrorReport;

static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Set on threads that are delivering a panic report
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// `errorType` used for reports built from panics
pub const PANIC_ERROR_TYPE: &str = "Panic";

/// Name of the threads that deliver panic reports
pub const REPORTER_THREAD: &str = "sightline-panic-report";

/// Build a report from a panic payload and location
pub fn panic_report(
    payload: &(dyn std::any::Any + Send),
    location: Option<(&str, u32, u32)>,
) -> ErrorReport {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };

    ErrorReport {
        message,
        filename: location.map(|(file, _, _)| file.to_string()),
        lineno: location.map(|(_, line, _)| line),
        colno: location.map(|(_, _, col)| col),
        stack: None,
        error_type: Some(PANIC_ERROR_TYPE.to_string()),
    }
}

/// Run `report` on a reporter thread. Returns `false` when the report was
/// skipped because this thread is itself delivering one.
pub fn deliver<F>(report: &Arc<F>, error: ErrorReport) -> bool
where
    F: Fn(ErrorReport) + Send + Sync + 'static,
{
    if REPORTING.with(Cell::get) {
        return false;
    }

    let report = Arc::clone(report);
    std::thread::Builder::new()
        .name(REPORTER_THREAD.to_string())
        .spawn(move || {
            REPORTING.with(|flag| flag.set(true));
            report(error);
        })
        .is_ok()
}

/// Report every panic to `report`, then run the previous hook.
///
/// Only the first call installs a hook; later calls return `false`.
pub fn install_panic_hook<F>(report: F) -> bool
where
    F: Fn(ErrorReport) + Send + Sync + 'static,
{
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let report = Arc::new(report);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()));
        deliver(&report, panic_report(info.payload(), location));
        previous(info);
    }));
    true
}
