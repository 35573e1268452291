//! Event queue and batcher
//!
//! A [`Batcher`] buffers items in call order and hands them to a
//! [`BatchSink`] when the buffer reaches its size, when the timeout since the
//! first buffered item elapses, or on an explicit flush. The buffer is
//! drained under the lock and the sink is called after it is released, so
//! items enqueued while a batch is being delivered start a new batch.
//!
//! Sinks are synchronous: they hand the payload to the transport and return.
//! That keeps [`Batcher::flush`] usable from an unload handler that cannot
//! wait on anything.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;

use crate::config::TrackerConfig;
use crate::scheduler::{SharedScheduler, TimerId};

/// Why a batch left the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Buffer reached its size limit
    Size,
    /// Timeout since the first buffered item elapsed
    Timeout,
    /// Explicit `flush()` from the host
    Manual,
    /// Page is hiding or unloading
    Unload,
    /// Tracker is shutting down
    Shutdown,
    /// Batching is off; item sent as soon as it was enqueued
    Immediate,
}

impl FlushReason {
    /// The page may be gone before an async request completes
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlushReason::Unload)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Manual => "manual",
            FlushReason::Unload => "unload",
            FlushReason::Shutdown => "shutdown",
            FlushReason::Immediate => "immediate",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives what a [`Batcher`] flushes
pub trait BatchSink<T>: Send + Sync {
    /// Deliver one item on its own (batching disabled)
    fn send_single(&self, item: T, reason: FlushReason);

    /// Deliver a non-empty batch as a unit
    fn send_batch(&self, items: Vec<T>, reason: FlushReason);
}

/// Batching thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub enabled: bool,
    pub size: usize,
    pub timeout: Duration,
}

impl BatchConfig {
    /// Always-on batching with fixed thresholds
    pub fn fixed(size: usize, timeout: Duration) -> Self {
        Self {
            enabled: true,
            size: size.max(1),
            timeout,
        }
    }

    /// Thresholds for the track-event queue
    pub fn for_events(config: &TrackerConfig) -> Self {
        Self {
            enabled: config.enable_batching,
            size: config.batch_size.max(1),
            timeout: config.batch_timeout_duration(),
        }
    }
}

struct BatchState<T> {
    buffer: Vec<T>,
    timer: Option<TimerId>,
    /// Bumped on every drain so a stale timer cannot flush a newer batch
    generation: u64,
}

struct BatcherInner<T> {
    name: &'static str,
    config: BatchConfig,
    scheduler: SharedScheduler,
    sink: Arc<dyn BatchSink<T>>,
    state: Mutex<BatchState<T>>,
}

/// Ordered buffer with size and time thresholds
pub struct Batcher<T> {
    inner: Arc<BatcherInner<T>>,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(
        name: &'static str,
        config: BatchConfig,
        scheduler: SharedScheduler,
        sink: Arc<dyn BatchSink<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                name,
                config,
                scheduler,
                sink,
                state: Mutex::new(BatchState {
                    buffer: Vec::new(),
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.inner.config
    }

    /// Add an item, flushing when the size threshold is reached
    pub fn enqueue(&self, item: T) {
        let inner = &self.inner;
        if !inner.config.enabled {
            inner.sink.send_single(item, FlushReason::Immediate);
            return;
        }

        let full = {
            let mut state = inner.lock();
            state.buffer.push(item);
            if state.buffer.len() >= inner.config.size {
                Some(inner.drain(&mut state))
            } else {
                if state.timer.is_none() {
                    let generation = state.generation;
                    state.timer = Some(self.arm_timer(generation));
                }
                None
            }
        };

        if let Some(items) = full {
            inner.deliver(items, FlushReason::Size);
        }
    }

    /// Hand everything buffered to the sink. Returns the number of items.
    pub fn flush(&self, reason: FlushReason) -> usize {
        self.inner.flush(reason)
    }

    /// Drop everything buffered without sending. Returns the number dropped.
    pub fn discard(&self) -> usize {
        let dropped = {
            let mut state = self.inner.lock();
            self.inner.drain(&mut state).len()
        };
        if dropped > 0 {
            tracing::debug!(queue = self.inner.name, dropped, "discarded buffered items");
        }
        dropped
    }

    /// Items waiting in the buffer
    pub fn pending(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    fn arm_timer(&self, generation: u64) -> TimerId {
        let weak: Weak<BatcherInner<T>> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            self.inner.config.timeout,
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout(generation);
                }
            }
            .boxed(),
        )
    }
}

impl<T: Send + 'static> BatcherInner<T> {
    fn flush(&self, reason: FlushReason) -> usize {
        let items = {
            let mut state = self.lock();
            self.drain(&mut state)
        };
        let count = items.len();
        if count > 0 {
            self.deliver(items, reason);
        }
        count
    }

    fn on_timeout(&self, generation: u64) {
        let items = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            self.drain(&mut state)
        };
        if !items.is_empty() {
            self.deliver(items, FlushReason::Timeout);
        }
    }

    /// Take the buffer and disarm the timer
    fn drain(&self, state: &mut BatchState<T>) -> Vec<T> {
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.generation = state.generation.wrapping_add(1);
        std::mem::take(&mut state.buffer)
    }

    fn deliver(&self, items: Vec<T>, reason: FlushReason) {
        tracing::debug!(queue = self.name, count = items.len(), reason = %reason, "flushing batch");
        self.sink.send_batch(items, reason);
    }

    fn lock(&self) -> MutexGuard<'_, BatchState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<(Vec<u32>, FlushReason)>>,
        singles: Mutex<Vec<(u32, FlushReason)>>,
    }

    impl BatchSink<u32> for RecordingSink {
        fn send_single(&self, item: u32, reason: FlushReason) {
            self.singles.lock().unwrap().push((item, reason));
        }

        fn send_batch(&self, items: Vec<u32>, reason: FlushReason) {
            self.batches.lock().unwrap().push((items, reason));
        }
    }

    fn batcher(config: BatchConfig) -> (Batcher<u32>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let scheduler: SharedScheduler = Arc::new(TokioScheduler::current().unwrap());
        (Batcher::new("test", config, scheduler, sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_in_order() {
        let (queue, sink) = batcher(BatchConfig::fixed(3, Duration::from_secs(5)));

        queue.enqueue(1);
        queue.enqueue(2);
        assert!(sink.batches.lock().unwrap().is_empty());
        queue.enqueue(3);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.as_slice(), &[(vec![1, 2, 3], FlushReason::Size)]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_first_item() {
        let (queue, sink) = batcher(BatchConfig::fixed(10, Duration::from_millis(500)));

        queue.enqueue(1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.enqueue(2);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.as_slice(), &[(vec![1, 2], FlushReason::Timeout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_after_flush_start_new_batch() {
        let (queue, sink) = batcher(BatchConfig::fixed(2, Duration::from_millis(100)));

        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(
            batches.as_slice(),
            &[
                (vec![1, 2], FlushReason::Size),
                (vec![3], FlushReason::Timeout)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_disarms_timer() {
        let (queue, sink) = batcher(BatchConfig::fixed(10, Duration::from_millis(100)));

        queue.enqueue(7);
        assert_eq!(queue.flush(FlushReason::Manual), 1);
        assert_eq!(queue.flush(FlushReason::Manual), 0);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.as_slice(), &[(vec![7], FlushReason::Manual)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_sends_nothing() {
        let (queue, sink) = batcher(BatchConfig::fixed(10, Duration::from_millis(100)));

        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.discard(), 2);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_batching_sends_immediately() {
        let config = BatchConfig {
            enabled: false,
            size: 10,
            timeout: Duration::from_secs(5),
        };
        let (queue, sink) = batcher(config);

        queue.enqueue(1);
        queue.enqueue(2);

        assert_eq!(
            sink.singles.lock().unwrap().as_slice(),
            &[(1, FlushReason::Immediate), (2, FlushReason::Immediate)]
        );
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_event_config_from_tracker_config() {
        let config = TrackerConfig {
            batch_size: 3,
            batch_timeout: 250,
            ..TrackerConfig::new("site")
        };
        let batch = BatchConfig::for_events(&config);
        assert!(batch.enabled);
        assert_eq!(batch.size, 3);
        assert_eq!(batch.timeout, Duration::from_millis(250));
        assert!(FlushReason::Unload.is_terminal());
        assert!(!FlushReason::Manual.is_terminal());
    }
}
