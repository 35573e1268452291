//! Process-wide tracker
//!
//! Host code that cannot thread a [`Tracker`] handle around uses these
//! functions. The slot is filled by the first successful [`init`]; later
//! calls return the running tracker untouched, so repeated initialization
//! never registers a second set of listeners.
//!
//! The opt-out flag is readable and settable before initialization. An
//! opt-out recorded early is applied to the tracker when it starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::config::TrackerConfig;
use crate::capture::install_panic_hook;
use crate::event::ErrorReport;
use crate::tracker::{Tracker, TrackerEnv};

static TRACKER: Lazy<RwLock<Option<Tracker>>> = Lazy::new(|| RwLock::new(None));
static OPTED_OUT: AtomicBool = AtomicBool::new(false);

/// Start the process-wide tracker, or return the one already running
pub fn init(config: TrackerConfig, env: TrackerEnv) -> Tracker {
    let mut slot = write();
    if let Some(existing) = slot.as_ref() {
        tracing::debug!("tracker already initialized, ignoring init");
        return existing.clone();
    }

    let track_errors = config.track_errors;
    let tracker = Tracker::init(config, env);
    if !tracker.is_active() {
        return tracker;
    }

    if OPTED_OUT.load(Ordering::SeqCst) {
        tracker.opt_out();
    } else if tracker.is_opted_out() {
        OPTED_OUT.store(true, Ordering::SeqCst);
    }

    *slot = Some(tracker.clone());
    drop(slot);

    if track_errors && install_panic_hook(capture_error) {
        tracing::debug!("panic reporting enabled");
    }
    tracker
}

pub fn is_initialized() -> bool {
    read().is_some()
}

/// The running tracker, if any
pub fn instance() -> Option<Tracker> {
    read().clone()
}

pub fn track(name: &str, properties: Value) {
    if let Some(tracker) = read().as_ref() {
        tracker.track(name, properties);
    }
}

/// Report an error through the running tracker.
///
/// Never blocks: when the slot is being written (for example a panic during
/// `init`) the report is dropped.
pub fn capture_error(report: ErrorReport) {
    if let Ok(slot) = TRACKER.try_read() {
        if let Some(tracker) = slot.as_ref() {
            tracker.capture_error(report);
        }
    }
}

pub fn flush() -> usize {
    read().as_ref().map_or(0, Tracker::flush)
}

/// Opt out now; also applies to a tracker started later
pub fn opt_out() {
    OPTED_OUT.store(true, Ordering::SeqCst);
    if let Some(tracker) = read().as_ref() {
        tracker.opt_out();
    }
}

pub fn opt_in() {
    OPTED_OUT.store(false, Ordering::SeqCst);
    if let Some(tracker) = read().as_ref() {
        tracker.opt_in();
    }
}

/// Readable at any time, including before `init`
pub fn is_opted_out() -> bool {
    OPTED_OUT.load(Ordering::SeqCst) || read().as_ref().is_some_and(Tracker::is_opted_out)
}

/// Flush, wait for delivery, and empty the slot so `init` can run again
pub async fn shutdown(timeout: Duration) -> bool {
    let tracker = write().take();
    match tracker {
        Some(tracker) => {
            let delivered = tracker.shutdown(timeout).await;
            tracker.destroy();
            delivered
        }
        None => true,
    }
}

fn read() -> RwLockReadGuard<'static, Option<Tracker>> {
    match TRACKER.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write() -> RwLockWriteGuard<'static, Option<Tracker>> {
    match TRACKER.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
