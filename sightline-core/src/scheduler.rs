//! Timer and task scheduling
//!
//! Batch timeouts, retry backoff, screen-view debouncing and the FPS sampling
//! window all go through [`Scheduler`] rather than calling into tokio
//! directly. [`TokioScheduler`] derives its wall clock from the tokio
//! monotonic clock, so a runtime started with paused time
//! (`#[tokio::test(start_paused = true)]`) makes every timer and every
//! timestamp deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

/// Unit of deferred work
pub type Task = BoxFuture<'static, ()>;

/// Shared scheduler handle
pub type SharedScheduler = Arc<dyn Scheduler>;

/// Identifies a scheduled timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// "Schedule after delay" / "cancel" plus the clock the client reads
pub trait Scheduler: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;

    /// Run `task` once after `delay`
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending timer. Unknown or already-fired ids are ignored.
    fn cancel(&self, id: TimerId);

    /// Run `task` detached, as soon as possible
    fn spawn(&self, task: Task);

    /// Future that resolves after `delay`
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Scheduler backed by a tokio runtime
pub struct TokioScheduler {
    handle: Handle,
    origin: tokio::time::Instant,
    origin_ms: i64,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl TokioScheduler {
    /// Bind to the runtime of the calling context
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::with_handle(handle))
    }

    /// Bind to an explicit runtime handle
    pub fn with_handle(handle: Handle) -> Self {
        Self::with_origin(handle, chrono::Utc::now().timestamp_millis())
    }

    /// Bind to a runtime and pin the wall clock to `origin_ms` at creation
    pub fn with_origin(handle: Handle, origin_ms: i64) -> Self {
        let _guard = handle.enter();
        Self {
            origin: tokio::time::Instant::now(),
            handle,
            origin_ms,
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Scheduler for TokioScheduler {
    fn now_ms(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timers = Arc::clone(&self.timers);

        // Hold the map while spawning so the timer cannot remove its entry
        // before it has been inserted.
        let mut guard = match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut timers) = timers.lock() {
                timers.remove(&id);
            }
            task.await;
        });
        guard.insert(id, join.abort_handle());
        id
    }

    fn cancel(&self, id: TimerId) {
        let handle = self.timers.lock().ok().and_then(|mut t| t.remove(&id));
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn spawn(&self, task: Task) {
        self.handle.spawn(task);
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed()
    }
}
