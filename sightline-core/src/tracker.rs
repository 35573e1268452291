//! The tracker façade
//!
//! [`Tracker::init`] wires the identity store, privacy gate, batchers,
//! transports and vitals collector together and subscribes to the host's
//! lifecycle notifications. Every public method is infallible: failures are
//! logged and dropped, and a tracker built from an invalid configuration is
//! inert.
//!
//! ## Pipeline
//!
//! `track` checks the privacy gate first (before any identity is read or
//! minted), applies sampling, stamps identity and page context, and
//! enqueues. When the page hides or unloads, pending vitals are finalized
//! and every queue is flushed through the beacon transport.
//!
//! A host-supplied [`EventFilter`](crate::event::EventFilter) sees each
//! event after it is built and may drop it. Custom events sent with
//! [`Tracker::send_custom_event`] skip the event queue and go to the
//! `/events` endpoint in their own batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde_json::{Map, Value};
use url::Url;

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::engagement::EngagementTimer;
use crate::event::{
    Channel, CustomEventSpan, ErrorReport, ErrorSpan, Event, EventContext, MetricName, UtmParams,
    VitalSample, CUSTOM_EVENT_TYPE,
};
use crate::host::{query_param, Host, LifecycleEvent, LifecycleListener};
use crate::identity::{IdentityStore, SessionPolicy};
use crate::logging::diagnostic;
use crate::privacy::{PathMasker, PrivacyGate, PrivacyPolicy, PrivacyState};
use crate::queue::{BatchConfig, Batcher, FlushReason};
use crate::scheduler::{SharedScheduler, TimerId, TokioScheduler};
use crate::storage::HostStorage;
use crate::transport::{
    BeaconTransport, ChannelSink, DeliveryGate, Dispatcher, HttpSender, InFlight, ReqwestSender,
    RetryPolicy, RetryingTransport, DEFAULT_TIMEOUT,
};
use crate::vitals::{FpsSampler, Vital, VitalsCollector, FPS_WINDOW};

/// Errors are batched in groups of this size
pub const ERROR_BATCH_SIZE: usize = 10;
/// Vitals are batched in groups of this size
pub const VITALS_BATCH_SIZE: usize = 6;
/// Custom-event spans are batched in groups of this size
pub const CUSTOM_BATCH_SIZE: usize = 10;
/// Route changes closer together than this produce one screen view
pub const SCREEN_VIEW_DEBOUNCE: Duration = Duration::from_millis(50);

/// Name of the automatic page-view event
pub const SCREEN_VIEW_EVENT: &str = "screen_view";

/// Query parameters that opt the visitor out when set to `true`
const OPT_OUT_PARAMS: [&str; 2] = ["sl_opt_out", "no_tracking"];

/// What the tracker needs from its surroundings
#[derive(Clone)]
pub struct TrackerEnv {
    pub host: Arc<dyn Host>,
    pub storage: HostStorage,
    pub sender: Arc<dyn HttpSender>,
    pub scheduler: SharedScheduler,
}

impl TrackerEnv {
    pub fn new(
        host: Arc<dyn Host>,
        storage: HostStorage,
        sender: Arc<dyn HttpSender>,
        scheduler: SharedScheduler,
    ) -> Self {
        Self {
            host,
            storage,
            sender,
            scheduler,
        }
    }

    /// Reqwest transport on the current tokio runtime
    pub fn production(config: &TrackerConfig, host: Arc<dyn Host>, storage: HostStorage) -> Result<Self> {
        let client_id = config.resolve_client_id().unwrap_or_default();
        Ok(Self::new(
            host,
            storage,
            Arc::new(ReqwestSender::new(&client_id, DEFAULT_TIMEOUT)?),
            Arc::new(TokioScheduler::current()?),
        ))
    }
}

#[derive(Default)]
struct PageState {
    /// Location as of the latest route notification
    route: Option<Url>,
    /// Location of the latest screen view
    last_url: Option<Url>,
    page_count: u64,
    screen_view_timer: Option<TimerId>,
}

struct Runtime {
    config: TrackerConfig,
    host: Arc<dyn Host>,
    scheduler: SharedScheduler,
    identity: IdentityStore,
    privacy: Arc<PrivacyGate>,
    masker: PathMasker,
    events: Batcher<Event>,
    errors: Batcher<ErrorSpan>,
    vitals: Batcher<VitalSample>,
    custom: Batcher<CustomEventSpan>,
    collector: VitalsCollector,
    fps: FpsSampler,
    engagement: EngagementTimer,
    in_flight: Arc<InFlight>,
    page: Mutex<PageState>,
    globals: RwLock<Map<String, Value>>,
    listening: AtomicBool,
    destroyed: AtomicBool,
}

/// Handle to a running tracker. Clones share the same runtime.
#[derive(Clone, Default)]
pub struct Tracker {
    runtime: Option<Arc<Runtime>>,
}

impl Tracker {
    /// Build and start a tracker.
    ///
    /// Without a client id the returned tracker is inert: every call is a
    /// no-op and nothing is sent.
    pub fn init(config: TrackerConfig, env: TrackerEnv) -> Self {
        let debug = config.debug;
        let config = match config.prepare() {
            Ok(config) => config,
            Err(e) => {
                diagnostic!(debug, error = %e, "tracker disabled");
                return Self::inert();
            }
        };

        let runtime = Runtime::build(config, env);
        runtime.start();
        Self {
            runtime: Some(runtime),
        }
    }

    /// A tracker that does nothing
    pub fn inert() -> Self {
        Self { runtime: None }
    }

    pub fn is_active(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|rt| !rt.destroyed.load(Ordering::SeqCst))
    }

    /// Effective configuration, after defaults and clamping
    pub fn config(&self) -> Option<&TrackerConfig> {
        self.runtime.as_ref().map(|rt| &rt.config)
    }

    /// Record a custom event. `properties` should be a JSON object or null.
    pub fn track(&self, name: &str, properties: Value) {
        if let Some(rt) = &self.runtime {
            rt.track(name, into_properties(properties, rt.config.debug));
        }
    }

    /// Record an event tagged `event_type: "custom"`. Properties may override the tag.
    pub fn track_custom_event(&self, name: &str, properties: Value) {
        if let Some(rt) = &self.runtime {
            let mut tagged = Map::new();
            tagged.insert("event_type".to_string(), Value::from(CUSTOM_EVENT_TYPE));
            tagged.extend(into_properties(properties, rt.config.debug));
            rt.track(name, tagged);
        }
    }

    /// Queue a lean custom-event span for the `/events` endpoint
    pub fn send_custom_event(&self, name: &str, properties: Value) {
        if let Some(rt) = &self.runtime {
            rt.send_custom_event(name, into_properties(properties, rt.config.debug));
        }
    }

    /// Record a page view for the current location
    pub fn screen_view(&self, properties: Value) {
        if let Some(rt) = &self.runtime {
            rt.screen_view(into_properties(properties, rt.config.debug));
        }
    }

    /// Queue an error report (requires `trackErrors`)
    pub fn capture_error(&self, report: ErrorReport) {
        if let Some(rt) = &self.runtime {
            rt.capture_error(report);
        }
    }

    /// Feed one web-vitals observation (requires `trackWebVitals`)
    pub fn record_vital(&self, metric: MetricName, value: f64) {
        if let Some(rt) = &self.runtime {
            rt.record_vital(metric, value);
        }
    }

    /// Feed one rendered-frame timestamp to the FPS sampler
    pub fn record_frame(&self, timestamp_ms: f64) {
        if let Some(rt) = &self.runtime {
            if rt.config.track_web_vitals {
                rt.fps.record_frame(timestamp_ms);
            }
        }
    }

    /// Send everything buffered now. Returns the number of items handed off.
    pub fn flush(&self) -> usize {
        self.runtime
            .as_ref()
            .map_or(0, |rt| rt.flush(FlushReason::Manual))
    }

    /// Stop all tracking for this profile, dropping anything not yet sent
    pub fn opt_out(&self) {
        if let Some(rt) = &self.runtime {
            rt.opt_out();
        }
    }

    pub fn opt_in(&self) {
        if let Some(rt) = &self.runtime {
            rt.privacy.opt_in();
            tracing::info!("visitor opted back in");
        }
    }

    pub fn is_opted_out(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|rt| rt.privacy.is_opted_out())
    }

    /// Privacy decision for the current page
    pub fn privacy_state(&self) -> Option<PrivacyState> {
        self.runtime
            .as_ref()
            .map(|rt| rt.privacy.state(rt.host.location().path()))
    }

    /// Merge `properties` into every subsequent event
    pub fn set_global_properties(&self, properties: Value) {
        if let Some(rt) = &self.runtime {
            let properties = into_properties(properties, rt.config.debug);
            write(&rt.globals).extend(properties);
        }
    }

    /// Forget identity, global properties and page count
    pub fn clear(&self) {
        if let Some(rt) = &self.runtime {
            rt.clear();
        }
    }

    /// End the current session; the next event starts a new one
    pub fn expire_session(&self) {
        if let Some(rt) = &self.runtime {
            rt.identity.expire_session();
        }
    }

    /// Anonymous id, if one exists yet
    pub fn anonymous_id(&self) -> Option<String> {
        self.runtime.as_ref().and_then(|rt| rt.identity.anonymous_id())
    }

    /// Session id, if one exists yet
    pub fn session_id(&self) -> Option<String> {
        self.runtime
            .as_ref()
            .and_then(|rt| rt.identity.session().map(|s| s.id))
    }

    /// Items waiting in the event, error, vitals and custom-event queues
    pub fn pending(&self) -> usize {
        self.runtime.as_ref().map_or(0, |rt| {
            rt.events.pending() + rt.errors.pending() + rt.vitals.pending() + rt.custom.pending()
        })
    }

    /// Visible time on the current page view
    pub fn engaged_time(&self) -> Duration {
        self.runtime.as_ref().map_or(Duration::ZERO, |rt| {
            rt.engagement.engaged(rt.scheduler.now_ms())
        })
    }

    /// Wait for dispatched deliveries to finish. `false` on timeout.
    pub async fn idle(&self, timeout: Duration) -> bool {
        match &self.runtime {
            Some(rt) => rt.in_flight.wait_idle(timeout).await,
            None => true,
        }
    }

    /// Flush everything and wait for delivery. `false` on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let Some(rt) = &self.runtime else {
            return true;
        };
        rt.finalize_vitals();
        rt.flush(FlushReason::Shutdown);
        rt.in_flight.wait_idle(timeout).await
    }

    /// Detach from the host and drop anything buffered. Later calls no-op.
    pub fn destroy(&self) {
        if let Some(rt) = &self.runtime {
            rt.destroy();
        }
    }
}

impl Runtime {
    fn build(config: TrackerConfig, env: TrackerEnv) -> Arc<Self> {
        let TrackerEnv {
            host,
            storage,
            sender,
            scheduler,
        } = env;

        let privacy = Arc::new(PrivacyGate::new(
            Arc::clone(&storage.local),
            Arc::clone(&host),
            PrivacyPolicy::from_config(&config),
        ));
        let identity = IdentityStore::new(
            Arc::clone(&storage.local),
            Arc::clone(&storage.session),
            SessionPolicy {
                idle_timeout: config.session_timeout_duration(),
            },
        );

        let in_flight = Arc::new(InFlight::new());
        let gate_privacy = Arc::clone(&privacy);
        let gate: Arc<dyn DeliveryGate> = Arc::new(move || !gate_privacy.is_opted_out());
        let retrying = RetryingTransport::new(
            Arc::clone(&sender),
            Arc::clone(&scheduler),
            RetryPolicy::from_config(&config),
            Arc::clone(&gate),
            Arc::clone(&in_flight),
        );
        let beacon = BeaconTransport::new(
            sender,
            Arc::clone(&scheduler),
            gate,
            Arc::clone(&in_flight),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.api_url.clone(),
            config.client_id(),
            retrying,
            beacon,
        ));

        let timeout = config.batch_timeout_duration();
        let events = Batcher::new(
            "events",
            BatchConfig::for_events(&config),
            Arc::clone(&scheduler),
            Arc::new(ChannelSink::new(Channel::Events, Arc::clone(&dispatcher))),
        );
        let errors = Batcher::new(
            "errors",
            BatchConfig::fixed(ERROR_BATCH_SIZE, timeout),
            Arc::clone(&scheduler),
            Arc::new(ChannelSink::new(Channel::Errors, Arc::clone(&dispatcher))),
        );
        let vitals = Batcher::new(
            "vitals",
            BatchConfig::fixed(VITALS_BATCH_SIZE, timeout),
            Arc::clone(&scheduler),
            Arc::new(ChannelSink::new(Channel::Vitals, Arc::clone(&dispatcher))),
        );
        let custom = Batcher::new(
            "custom",
            BatchConfig::fixed(CUSTOM_BATCH_SIZE, timeout),
            Arc::clone(&scheduler),
            Arc::new(ChannelSink::new(Channel::Custom, dispatcher)),
        );

        Arc::new(Self {
            masker: PathMasker::new(config.mask_patterns.clone()),
            config,
            host,
            scheduler,
            identity,
            privacy,
            events,
            errors,
            vitals,
            custom,
            collector: VitalsCollector::new(),
            fps: FpsSampler::new(),
            engagement: EngagementTimer::new(),
            in_flight,
            page: Mutex::new(PageState::default()),
            globals: RwLock::new(Map::new()),
            listening: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    fn start(self: &Arc<Self>) {
        let location = self.host.location();

        if OPT_OUT_PARAMS
            .iter()
            .any(|param| query_param(&location, param).as_deref() == Some("true"))
        {
            tracing::info!("opt-out requested by page url");
            self.privacy.opt_out();
        }

        if self.allowed(location.path()) {
            if let Some(anon) = query_param(&location, "anonId") {
                self.identity.adopt_anonymous_id(&anon);
            }
            if let Some(session) = query_param(&location, "sessionId") {
                self.identity
                    .adopt_session_id(&session, self.scheduler.now_ms());
            }
        }

        lock(&self.page).route = Some(location);
        self.engagement.start(self.scheduler.now_ms());
        self.listen();

        if self.config.track_web_vitals {
            let weak = Arc::downgrade(self);
            self.scheduler.schedule(
                FPS_WINDOW,
                async move {
                    if let Some(rt) = weak.upgrade() {
                        rt.finish_fps();
                    }
                }
                .boxed(),
            );
        }

        if self.config.track_screen_views {
            self.screen_view(Map::new());
        }

        tracing::info!(
            client_id = %self.config.client_id(),
            api_url = %self.config.api_url,
            batching = self.config.enable_batching,
            retries = self.config.enable_retries,
            "tracker initialized"
        );
    }

    /// Subscribe to lifecycle notifications once
    fn listen(self: &Arc<Self>) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        self.host.add_lifecycle_listener(Arc::new(LifecycleHandler {
            runtime: Arc::downgrade(self),
        }));
    }

    fn allowed(&self, path: &str) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        match self.privacy.state(path) {
            PrivacyState::Allowed => true,
            state => {
                tracing::debug!(path, ?state, "tracking suppressed");
                false
            }
        }
    }

    fn sampled(&self) -> bool {
        let rate = self.config.sampling_rate;
        rate >= 1.0 || rand::thread_rng().gen::<f64>() < rate
    }

    /// Origin, masked path, query and fragment of `url`
    fn page_path(&self, url: &Url) -> String {
        let mut path = url.origin().ascii_serialization();
        path.push_str(&self.masker.mask(url.path()));
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            path.push('#');
            path.push_str(fragment);
        }
        path
    }

    /// Key under which vitals are de-duplicated: one per page view, so the
    /// fragment only counts when hash changes are page views
    fn page_key(&self, url: &Url) -> String {
        if self.config.track_hash_changes {
            return self.page_path(url);
        }
        let mut document = url.clone();
        document.set_fragment(None);
        self.page_path(&document)
    }

    fn context(&self, url: &Url) -> EventContext {
        let now = self.scheduler.now_ms();
        let anonymous_id = self.identity.get_or_create_anonymous_id();
        let session_id = self.identity.get_or_create_session_id(now);
        EventContext {
            anonymous_id,
            session_id,
            session_start_time: self.identity.session_start_ms().unwrap_or(now),
            timestamp: now,
            path: self.page_path(url),
            title: self.host.title(),
            referrer: self.host.referrer(),
            language: self.host.language(),
            timezone: self.host.timezone(),
            utm: UtmParams::from_url(url),
        }
    }

    fn track(&self, name: &str, properties: Map<String, Value>) {
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }
        if !self.sampled() {
            tracing::debug!(event = name, "event sampled out");
            return;
        }

        let context = self.context(&url);
        let event = Event::new(name, context, &read(&self.globals), properties);
        if let Some(filter) = &self.config.filter {
            if !filter.allows(&event) {
                tracing::debug!(event = name, "event rejected by filter");
                return;
            }
        }
        self.events.enqueue(event);
    }

    fn send_custom_event(&self, name: &str, properties: Map<String, Value>) {
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }
        let span = CustomEventSpan::new(name, properties, &self.context(&url));
        self.custom.enqueue(span);
    }

    fn screen_view(&self, mut properties: Map<String, Value>) {
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }

        let page_count = {
            let mut page = lock(&self.page);
            if page.last_url.as_ref() == Some(&url) {
                return;
            }
            if !self.config.track_hash_changes {
                if let Some(last) = &page.last_url {
                    if is_hash_only_change(last, &url) {
                        return;
                    }
                }
            }
            page.last_url = Some(url);
            page.page_count += 1;
            page.page_count
        };
        self.engagement.reset(self.scheduler.now_ms());

        properties.insert("page_count".to_string(), Value::from(page_count));
        self.track(SCREEN_VIEW_EVENT, properties);
    }

    fn capture_error(&self, report: ErrorReport) {
        if !self.config.track_errors {
            return;
        }
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }
        let span = ErrorSpan::new(report, &self.context(&url));
        self.errors.enqueue(span);
    }

    fn record_vital(&self, metric: MetricName, value: f64) {
        if !self.config.track_web_vitals {
            return;
        }
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }
        if let Some(vital) = self.collector.record(&self.page_key(&url), metric, value) {
            self.enqueue_vital(vital);
        }
    }

    fn enqueue_vital(&self, vital: Vital) {
        let url = self.host.location();
        if !self.allowed(url.path()) {
            return;
        }
        let context = self.context(&url);
        self.vitals.enqueue(VitalSample {
            timestamp: context.timestamp,
            path: vital.path,
            metric_name: vital.metric,
            metric_value: vital.value,
            anonymous_id: context.anonymous_id,
            session_id: context.session_id,
        });
    }

    fn finish_fps(&self) {
        if let Some(fps) = self.fps.finish() {
            self.record_vital(MetricName::Fps, fps);
        }
    }

    fn finalize_vitals(&self) {
        for vital in self.collector.finalize() {
            self.enqueue_vital(vital);
        }
    }

    fn flush(&self, reason: FlushReason) -> usize {
        self.events.flush(reason)
            + self.errors.flush(reason)
            + self.vitals.flush(reason)
            + self.custom.flush(reason)
    }

    fn discard(&self) -> usize {
        self.events.discard() + self.errors.discard() + self.vitals.discard() + self.custom.discard()
    }

    fn on_route_change(self: &Arc<Self>, url: &Url) {
        let same_page = {
            let mut page = lock(&self.page);
            let previous = page.route.replace(url.clone());
            !self.config.track_hash_changes
                && previous.is_some_and(|prev| prev == *url || is_hash_only_change(&prev, url))
        };
        if !same_page {
            self.finalize_vitals();
        }
        if !self.config.track_screen_views {
            return;
        }

        let mut page = lock(&self.page);
        if let Some(timer) = page.screen_view_timer.take() {
            self.scheduler.cancel(timer);
        }
        let weak = Arc::downgrade(self);
        page.screen_view_timer = Some(self.scheduler.schedule(
            SCREEN_VIEW_DEBOUNCE,
            async move {
                if let Some(rt) = weak.upgrade() {
                    lock(&rt.page).screen_view_timer = None;
                    rt.screen_view(Map::new());
                }
            }
            .boxed(),
        ));
    }

    fn on_lifecycle(self: &Arc<Self>, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::VisibilityHidden | LifecycleEvent::PageHide => {
                self.engagement.pause(self.scheduler.now_ms());
                self.finalize_vitals();
                let flushed = self.flush(FlushReason::Unload);
                tracing::debug!(?event, flushed, "page hiding, flushed queues");
            }
            LifecycleEvent::RouteChange(url) => {
                tracing::debug!(url = %url, "route change");
                self.on_route_change(url);
            }
            LifecycleEvent::VisibilityVisible => {
                self.engagement.start(self.scheduler.now_ms());
            }
        }
    }

    fn opt_out(&self) {
        self.privacy.opt_out();
        let dropped = self.discard();
        self.collector.stop();
        self.cancel_screen_view();
        tracing::info!(dropped, "visitor opted out");
    }

    fn clear(&self) {
        write(&self.globals).clear();
        {
            let mut page = lock(&self.page);
            page.last_url = None;
            page.page_count = 0;
        }
        let (anonymous_id, session_id) = self.identity.reset(self.scheduler.now_ms());
        tracing::debug!(%anonymous_id, %session_id, "identity reset");
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.discard();
        self.collector.stop();
        self.cancel_screen_view();
        self.engagement.pause(self.scheduler.now_ms());
        tracing::debug!(dropped, "tracker destroyed");
    }

    fn cancel_screen_view(&self) {
        if let Some(timer) = lock(&self.page).screen_view_timer.take() {
            self.scheduler.cancel(timer);
        }
    }
}

/// Forwards host lifecycle notifications without keeping the tracker alive
struct LifecycleHandler {
    runtime: Weak<Runtime>,
}

impl LifecycleListener for LifecycleHandler {
    fn on_lifecycle(&self, event: &LifecycleEvent) {
        if let Some(rt) = self.runtime.upgrade() {
            if !rt.destroyed.load(Ordering::SeqCst) {
                rt.on_lifecycle(event);
            }
        }
    }
}

/// Same document, only the fragment differs
pub fn is_hash_only_change(previous: &Url, current: &Url) -> bool {
    previous.origin() == current.origin()
        && previous.path() == current.path()
        && previous.query() == current.query()
        && previous.fragment() != current.fragment()
}

fn into_properties(value: Value, debug: bool) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            diagnostic!(debug, value = %other, "event properties must be an object, ignoring");
            Map::new()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
