//! Shared fixtures for tracker integration tests
//!
//! [`RecordingSender`] stands in for the network: it answers with scripted
//! statuses and records every request. [`Harness`] bundles it with an
//! in-process host, in-memory storage and a scheduler on the test's tokio
//! runtime (start tests with `start_paused = true` for a fake clock).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sightline_core::transport::HttpSender;
use sightline_core::{
    HostStorage, Result, StaticHost, TokioScheduler, Tracker, TrackerConfig, TrackerEnv,
};
use tokio::runtime::Handle;
use url::Url;

/// Wall clock at the start of every harness
pub const EPOCH_MS: i64 = 1_700_000_000_000;

pub const CLIENT_ID: &str = "site-test";
pub const API_URL: &str = "https://collector.test";

/// One request as the collector would have seen it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: Url,
    pub body: Value,
}

impl RecordedRequest {
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Payload items: the array for batches, the object itself otherwise
    pub fn items(&self) -> Vec<Value> {
        match &self.body {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// `name` of every event in the payload
    pub fn names(&self) -> Vec<String> {
        self.items()
            .iter()
            .filter_map(|item| item["name"].as_str().map(str::to_string))
            .collect()
    }
}

/// Scripted collector: pops a status per request, 200 once the script ends
#[derive(Default)]
pub struct RecordingSender {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_statuses(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests sent to `path`
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path() == path)
            .collect()
    }

    /// Every event name delivered, across requests, in arrival order
    pub fn event_names(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter(|r| r.path() == "/" || r.path() == "/batch")
            .flat_map(RecordedRequest::names)
            .collect()
    }
}

#[async_trait]
impl HttpSender for RecordingSender {
    async fn post_json(&self, url: &Url, body: &str) -> Result<u16> {
        let body = serde_json::from_str(body)?;
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.clone(),
            body,
        });
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(200))
    }
}

/// Host, storage, network and clock for one simulated page
pub struct Harness {
    pub host: Arc<StaticHost>,
    pub storage: HostStorage,
    pub sender: Arc<RecordingSender>,
    pub scheduler: Arc<TokioScheduler>,
}

impl Harness {
    /// Page at `url` with fresh storage and an always-200 collector
    pub fn new(url: &str) -> Self {
        Self::with_sender(url, RecordingSender::new())
    }

    pub fn with_sender(url: &str, sender: Arc<RecordingSender>) -> Self {
        Self::with_storage(url, HostStorage::in_memory(), sender)
    }

    pub fn with_storage(url: &str, storage: HostStorage, sender: Arc<RecordingSender>) -> Self {
        sightline_core::logging::init_test();
        Self {
            host: Arc::new(StaticHost::parse(url).unwrap()),
            storage,
            sender,
            scheduler: Arc::new(TokioScheduler::with_origin(Handle::current(), EPOCH_MS)),
        }
    }

    /// A new page load over the same storage and collector
    pub fn reload(&self, url: &str) -> Self {
        Self::with_storage(url, self.storage.clone(), Arc::clone(&self.sender))
    }

    pub fn env(&self) -> TrackerEnv {
        TrackerEnv::new(
            self.host.clone(),
            self.storage.clone(),
            self.sender.clone(),
            self.scheduler.clone(),
        )
    }

    pub fn start(&self, config: TrackerConfig) -> Tracker {
        Tracker::init(config, self.env())
    }
}

/// Client id and collector set; automatic screen views off
pub fn config() -> TrackerConfig {
    TrackerConfig {
        api_url: API_URL.to_string(),
        track_screen_views: false,
        ..TrackerConfig::new(CLIENT_ID)
    }
}

/// Let timers and spawned deliveries run for `ms` of (paused) time
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Wait for every dispatched delivery to finish
pub async fn settle(tracker: &Tracker) {
    assert!(
        tracker.idle(Duration::from_secs(300)).await,
        "deliveries did not settle"
    );
}
