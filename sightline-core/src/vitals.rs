//! Web-vitals de-duplication and FPS sampling
//!
//! The host reports raw metric observations; [`VitalsCollector`] decides
//! which of them become samples. Per page path each metric is emitted at
//! most once:
//!
//! - FCP, TTFB and FPS are final on their first report and emitted at once.
//! - LCP, CLS and INP keep updating while the page is visible. The latest
//!   value is held as pending and emitted by [`VitalsCollector::finalize`],
//!   which the tracker calls when the page hides, unloads, or navigates.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::event::MetricName;

/// Values above this are treated as measurement noise and clamped
pub const MAX_METRIC_VALUE: f64 = 60_000.0;

/// How long frame timestamps are collected for the FPS sample
pub const FPS_WINDOW: Duration = Duration::from_millis(2000);

/// A metric value ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct Vital {
    pub path: String,
    pub metric: MetricName,
    pub value: f64,
}

#[derive(Default)]
struct VitalsState {
    emitted: HashSet<(String, MetricName)>,
    pending: HashMap<(String, MetricName), f64>,
    stopped: bool,
}

/// Tracks what has been emitted per page view
#[derive(Default)]
pub struct VitalsCollector {
    state: Mutex<VitalsState>,
}

impl VitalsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one observation. Returns the vital when it is final now.
    pub fn record(&self, path: &str, metric: MetricName, value: f64) -> Option<Vital> {
        if !value.is_finite() || value < 0.0 {
            tracing::debug!(metric = %metric, value, "ignoring invalid metric value");
            return None;
        }
        let value = value.min(MAX_METRIC_VALUE);

        let mut state = self.lock();
        if state.stopped {
            return None;
        }
        let key = (path.to_string(), metric);
        if state.emitted.contains(&key) {
            return None;
        }

        if metric.is_final_on_first_report() {
            state.emitted.insert(key);
            Some(Vital {
                path: path.to_string(),
                metric,
                value,
            })
        } else {
            state.pending.insert(key, value);
            None
        }
    }

    /// Emit every pending value and mark it as sent
    pub fn finalize(&self) -> Vec<Vital> {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);

        let mut vitals: Vec<Vital> = pending
            .into_iter()
            .map(|((path, metric), value)| Vital {
                path,
                metric,
                value,
            })
            .collect();
        vitals.sort_by_key(|v| {
            let rank = MetricName::ALL
                .iter()
                .position(|m| *m == v.metric)
                .unwrap_or(usize::MAX);
            (v.path.clone(), rank)
        });
        for vital in &vitals {
            state.emitted.insert((vital.path.clone(), vital.metric));
        }
        vitals
    }

    /// Whether `metric` was already emitted for `path`
    pub fn was_emitted(&self, path: &str, metric: MetricName) -> bool {
        self.lock().emitted.contains(&(path.to_string(), metric))
    }

    /// Stop collecting and forget anything pending
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.pending.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn lock(&self) -> MutexGuard<'_, VitalsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Default)]
struct FpsState {
    first: Option<f64>,
    last: f64,
    frames: u32,
    done: bool,
}

/// Counts frames over one bounded window
#[derive(Default)]
pub struct FpsSampler {
    state: Mutex<FpsState>,
}

impl FpsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame was rendered at `timestamp_ms`. Ignored once finished.
    pub fn record_frame(&self, timestamp_ms: f64) {
        let mut state = self.lock();
        if state.done || !timestamp_ms.is_finite() {
            return;
        }
        if state.first.is_none() {
            state.first = Some(timestamp_ms);
        }
        state.last = timestamp_ms;
        state.frames += 1;
    }

    /// Close the window and compute frames per second.
    ///
    /// `None` when fewer than two frames were seen or the window was
    /// already closed.
    pub fn finish(&self) -> Option<f64> {
        let mut state = self.lock();
        if state.done {
            return None;
        }
        state.done = true;

        let first = state.first?;
        let elapsed = state.last - first;
        if state.frames < 2 || elapsed <= 0.0 {
            return None;
        }
        Some((f64::from(state.frames - 1) * 1000.0 / elapsed).round())
    }

    pub fn is_finished(&self) -> bool {
        self.lock().done
    }

    fn lock(&self) -> MutexGuard<'_, FpsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_metrics_emit_once() {
        let vitals = VitalsCollector::new();

        let first = vitals.record("/", MetricName::Fcp, 812.0).unwrap();
        assert_eq!(first.value, 812.0);
        assert!(vitals.record("/", MetricName::Fcp, 900.0).is_none());
        assert!(vitals.was_emitted("/", MetricName::Fcp));

        // Another page view gets its own sample.
        assert!(vitals.record("/pricing", MetricName::Fcp, 400.0).is_some());
    }

    #[test]
    fn test_updating_metrics_keep_latest_until_finalized() {
        let vitals = VitalsCollector::new();

        assert!(vitals.record("/", MetricName::Cls, 0.01).is_none());
        assert!(vitals.record("/", MetricName::Cls, 0.05).is_none());
        assert!(vitals.record("/", MetricName::Lcp, 1200.0).is_none());

        let emitted = vitals.finalize();
        assert_eq!(
            emitted,
            vec![
                Vital {
                    path: "/".to_string(),
                    metric: MetricName::Lcp,
                    value: 1200.0
                },
                Vital {
                    path: "/".to_string(),
                    metric: MetricName::Cls,
                    value: 0.05
                },
            ]
        );

        // Late updates after emission are dropped.
        assert!(vitals.record("/", MetricName::Cls, 0.3).is_none());
        assert!(vitals.finalize().is_empty());
    }

    #[test]
    fn test_invalid_values_dropped_and_large_values_clamped() {
        let vitals = VitalsCollector::new();
        assert!(vitals.record("/", MetricName::Ttfb, f64::NAN).is_none());
        assert!(vitals.record("/", MetricName::Ttfb, -1.0).is_none());
        assert!(!vitals.was_emitted("/", MetricName::Ttfb));

        let clamped = vitals.record("/", MetricName::Ttfb, 1e9).unwrap();
        assert_eq!(clamped.value, MAX_METRIC_VALUE);
    }

    #[test]
    fn test_stop_drops_pending() {
        let vitals = VitalsCollector::new();
        vitals.record("/", MetricName::Inp, 120.0);
        vitals.stop();

        assert!(vitals.finalize().is_empty());
        assert!(vitals.record("/", MetricName::Fcp, 1.0).is_none());
        assert!(vitals.is_stopped());
    }

    #[test]
    fn test_fps_from_frame_timestamps() {
        let sampler = FpsSampler::new();
        // 61 frames over one second at ~60 fps.
        for i in 0..=60 {
            sampler.record_frame(1000.0 + f64::from(i) * (1000.0 / 60.0));
        }
        assert_eq!(sampler.finish(), Some(60.0));

        // Bounded: nothing after the window closes.
        sampler.record_frame(5000.0);
        assert_eq!(sampler.finish(), None);
        assert!(sampler.is_finished());
    }

    #[test]
    fn test_fps_needs_two_frames() {
        let sampler = FpsSampler::new();
        sampler.record_frame(10.0);
        assert_eq!(sampler.finish(), None);

        let empty = FpsSampler::new();
        assert_eq!(empty.finish(), None);
    }
}
