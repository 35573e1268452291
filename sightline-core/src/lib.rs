//! # sightline-core
//!
//! Telemetry capture and delivery client for sightline.
//!
//! This library provides:
//! - Anonymous visitor and session identity with persisted storage
//! - Privacy gating (opt-out, do-not-track, skip patterns, bot signals)
//! - Batched, retried delivery of events, custom events, errors and web vitals
//! - Campaign (`utm_*`) and locale context, engagement time
//! - A host abstraction for page location, lifecycle and storage
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! A call flows through the layers in order:
//! - **Privacy gate:** decides whether anything happens at all
//! - **Identity:** stamps anonymous and session ids
//! - **Queue:** buffers events and flushes them on size, time or demand
//! - **Transport:** retrying requests in-page, beacons on unload
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sightline_core::{HostStorage, StaticHost, Tracker, TrackerConfig, TrackerEnv};
//!
//! # async fn run() -> sightline_core::Result<()> {
//! let config = TrackerConfig::new("my-site");
//! let host = Arc::new(StaticHost::parse("https://example.com/pricing")?);
//! let env = TrackerEnv::production(&config, host, HostStorage::in_memory())?;
//!
//! let tracker = Tracker::init(config, env);
//! tracker.track("signup_clicked", serde_json::json!({ "plan": "pro" }));
//! tracker.shutdown(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, TrackerConfig};
pub use error::{Error, Result};
pub use event::{
    Channel, CustomEventSpan, ErrorReport, ErrorSpan, Event, EventFilter, MetricName, UtmParams,
    VitalSample,
};
pub use host::{Host, LifecycleEvent, LifecycleListener, StaticHost};
pub use identity::IdentityStore;
pub use privacy::{PrivacyGate, PrivacyState, Suppression};
pub use queue::FlushReason;
pub use scheduler::{Scheduler, SharedScheduler, TokioScheduler};
pub use storage::{FileStorage, HostStorage, MemoryStorage, Storage};
pub use tracker::{Tracker, TrackerEnv};
pub use transport::{HttpSender, ReqwestSender};

// Public modules
pub mod capture;
pub mod config;
pub mod engagement;
pub mod error;
pub mod event;
pub mod global;
pub mod host;
pub mod identity;
pub mod logging;
pub mod privacy;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod vitals;
